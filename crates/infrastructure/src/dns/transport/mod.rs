//! Upstream transports. A [`Connection`] is one open socket (UDP, TCP or
//! TLS over TCP) that can carry request/reply exchanges until it is dropped.

pub mod tcp;
pub mod tls;
pub mod udp;

use fdyn_domain::DomainError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

pub use tls::TlsDialer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tcp-tls",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            TransportKind::Udp => 0,
            TransportKind::Tcp => 1,
            TransportKind::Tls => 2,
        }
    }
}

pub enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    pub async fn dial(
        kind: TransportKind,
        server_addr: SocketAddr,
        tls: Option<&TlsDialer>,
        timeout: Duration,
    ) -> Result<Self, DomainError> {
        match kind {
            TransportKind::Udp => udp::connect(server_addr).await.map(Connection::Udp),
            TransportKind::Tcp => tcp::connect(server_addr, timeout).await.map(Connection::Tcp),
            TransportKind::Tls => {
                let dialer = tls.ok_or_else(|| {
                    DomainError::TlsError(format!("No TLS configuration for {}", server_addr))
                })?;
                let stream = dialer.connect(server_addr, timeout).await?;
                Ok(Connection::Tls(Box::new(stream)))
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Connection::Udp(_) => TransportKind::Udp,
            Connection::Tcp(_) => TransportKind::Tcp,
            Connection::Tls(_) => TransportKind::Tls,
        }
    }

    /// Writes one message and reads one reply. The io error kind is kept so
    /// callers can tell a peer-closed stream from a failing upstream.
    pub async fn exchange(&mut self, message: &[u8], timeout: Duration) -> io::Result<Vec<u8>> {
        match self {
            Connection::Udp(socket) => udp::exchange(socket, message, timeout).await,
            Connection::Tcp(stream) => tcp::exchange(stream, message, timeout).await,
            Connection::Tls(stream) => tcp::exchange(stream.as_mut(), message, timeout).await,
        }
    }
}

pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream exchange timed out"))?
}

/// The remote end went away between exchanges.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

pub fn map_io_error(err: io::Error, server_addr: SocketAddr) -> DomainError {
    let server = server_addr.to_string();
    match err.kind() {
        io::ErrorKind::TimedOut => DomainError::TransportTimeout { server },
        io::ErrorKind::ConnectionRefused => DomainError::TransportConnectionRefused { server },
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => DomainError::TransportConnectionReset { server },
        _ => DomainError::IoError(format!("{}: {}", server, err)),
    }
}
