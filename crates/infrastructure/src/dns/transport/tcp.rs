use super::{map_io_error, with_timeout};
use fdyn_domain::DomainError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const MAX_TCP_MESSAGE_SIZE: usize = 65535;

pub async fn connect(server_addr: SocketAddr, timeout: Duration) -> Result<TcpStream, DomainError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
        .await
        .map_err(|_| DomainError::TransportTimeout {
            server: server_addr.to_string(),
        })?
        .map_err(|e| map_io_error(e, server_addr))?;

    stream.set_nodelay(true).map_err(|e| {
        DomainError::IoError(format!(
            "Failed to set TCP_NODELAY on {}: {}",
            server_addr, e
        ))
    })?;

    Ok(stream)
}

pub(crate) async fn exchange<S>(
    stream: &mut S,
    message: &[u8],
    timeout: Duration,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, send_with_length_prefix(stream, message)).await?;
    debug!(message_len = message.len(), "TCP query sent");

    let response = with_timeout(timeout, read_with_length_prefix(stream)).await?;
    debug!(response_len = response.len(), "TCP response received");
    Ok(response)
}

pub async fn send_with_length_prefix<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let length = u16::try_from(message.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("DNS message too large: {} bytes", message.len()),
        )
    })?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&length.to_be_bytes());
    framed.extend_from_slice(message);

    stream.write_all(&framed).await?;
    stream.flush().await
}

pub async fn read_with_length_prefix<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len == 0 || response_len > MAX_TCP_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid DNS message length: {}", response_len),
        ));
    }

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}
