//! UDP Transport for DNS queries (RFC 1035 §4.2.1)
//!
//! Messages are sent as-is (no framing). The socket is connected to the
//! upstream so the kernel drops datagrams from any other source. Late or
//! duplicated replies left in the socket buffer carry another id and are
//! skipped.
//! If the response has the TC (truncated) bit set, the caller decides
//! whether to retry over TCP.

use super::{map_io_error, with_timeout};
use fdyn_domain::DomainError;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const MAX_UDP_RESPONSE_SIZE: usize = 65535;

pub async fn connect(server_addr: SocketAddr) -> Result<UdpSocket, DomainError> {
    let bind_addr: SocketAddr = if server_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| DomainError::IoError(format!("Failed to bind UDP socket: {}", e)))?;
    socket
        .connect(server_addr)
        .await
        .map_err(|e| map_io_error(e, server_addr))?;

    Ok(socket)
}

pub(crate) async fn exchange(
    socket: &UdpSocket,
    message: &[u8],
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    let bytes_sent = with_timeout(timeout, socket.send(message)).await?;
    debug!(bytes_sent, "UDP query sent");

    let expected_id = message_id(message);
    let mut recv_buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let bytes_received = with_timeout(timeout, async {
        loop {
            let len = socket.recv(&mut recv_buf).await?;
            let id = message_id(&recv_buf[..len]);
            if expected_id.is_none() || id == expected_id {
                return Ok(len);
            }
            debug!(expected = ?expected_id, received = ?id, "Dropped UDP reply for another query");
        }
    })
    .await?;
    recv_buf.truncate(bytes_received);

    debug!(bytes_received, "UDP response received");
    Ok(recv_buf)
}

/// Header id of a wire message, if it is long enough to carry one.
fn message_id(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_exchange_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let socket = connect(server_addr).await.unwrap();
        let reply = exchange(&socket, b"ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_udp_exchange_skips_reply_with_other_id() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[0xde, 0xad, 9, 9], peer).await.unwrap();
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let socket = connect(server_addr).await.unwrap();
        let reply = exchange(&socket, &[0x12, 0x34, 1, 2], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec![0x12, 0x34, 1, 2]);
    }

    #[test]
    fn test_message_id() {
        assert_eq!(message_id(&[0x12, 0x34, 0]), Some(0x1234));
        assert_eq!(message_id(&[0x12]), None);
    }

    #[tokio::test]
    async fn test_udp_exchange_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = connect(server.local_addr().unwrap()).await.unwrap();

        let err = exchange(&socket, b"ping", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
