#![allow(dead_code)]
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// A records get this address; other types get an empty NOERROR.
    Answer(Ipv4Addr),
    /// TC over UDP, full answer over TCP.
    TruncateUdp(Ipv4Addr),
    /// Answers like `Answer` but sends every UDP reply twice.
    DuplicateUdp(Ipv4Addr),
    WrongId,
    ServFail,
    Silent,
}

#[derive(Default)]
struct Stats {
    udp_queries: AtomicUsize,
    tcp_queries: AtomicUsize,
    tcp_connections: AtomicUsize,
}

struct Shared {
    behavior: Mutex<Behavior>,
    close_tcp_after_reply: bool,
    stats: Stats,
}

/// UDP and TCP mock upstream listening on the same 127.0.0.1 port.
pub struct MockDnsServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl MockDnsServer {
    pub async fn start(behavior: Behavior) -> std::io::Result<Self> {
        Self::start_with(behavior, false).await
    }

    /// Closes every TCP connection right after its first reply.
    pub async fn start_closing_tcp(behavior: Behavior) -> std::io::Result<Self> {
        Self::start_with(behavior, true).await
    }

    async fn start_with(behavior: Behavior, close_tcp_after_reply: bool) -> std::io::Result<Self> {
        let (udp, tcp) = bind_pair().await?;
        let addr = udp.local_addr()?;
        let shared = Arc::new(Shared {
            behavior: Mutex::new(behavior),
            close_tcp_after_reply,
            stats: Stats::default(),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(serve_udp(udp, shared.clone(), shutdown.clone()));
        tokio::spawn(serve_tcp(tcp, shared.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shared,
            shutdown,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    pub fn udp_queries(&self) -> usize {
        self.shared.stats.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_queries(&self) -> usize {
        self.shared.stats.tcp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_connections(&self) -> usize {
        self.shared.stats.tcp_connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind_pair() -> std::io::Result<(UdpSocket, TcpListener)> {
    let mut last_err = None;
    for _ in 0..20 {
        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        let addr = tcp.local_addr()?;
        match UdpSocket::bind(addr).await {
            Ok(udp) => return Ok((udp, tcp)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no free port pair")))
}

async fn serve_udp(socket: UdpSocket, shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = result else { continue };
                shared.stats.udp_queries.fetch_add(1, Ordering::SeqCst);
                let behavior = *shared.behavior.lock().unwrap();
                if let Some(response) = build_response(behavior, &buf[..len], true) {
                    let _ = socket.send_to(&response, peer).await;
                    if matches!(behavior, Behavior::DuplicateUdp(_)) {
                        let _ = socket.send_to(&response, peer).await;
                    }
                }
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => {
                let Ok((stream, _)) = result else { continue };
                shared.stats.tcp_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_tcp_connection(stream, shared.clone(), shutdown.clone()));
            }
        }
    }
}

async fn serve_tcp_connection(mut stream: TcpStream, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stream.read_exact(&mut len_buf) => read,
        };
        if read.is_err() {
            return;
        }

        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }
        shared.stats.tcp_queries.fetch_add(1, Ordering::SeqCst);

        let behavior = *shared.behavior.lock().unwrap();
        if let Some(response) = build_response(behavior, &query, false) {
            let mut framed = (response.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&response);
            if stream.write_all(&framed).await.is_err() {
                return;
            }
            let _ = stream.flush().await;
        }

        if shared.close_tcp_after_reply {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

fn build_response(behavior: Behavior, query: &[u8], over_udp: bool) -> Option<Vec<u8>> {
    let query = Message::from_vec(query).ok()?;
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    reply.add_queries(query.queries().to_vec());

    match behavior {
        Behavior::Silent => return None,
        Behavior::ServFail => {
            reply.set_response_code(ResponseCode::ServFail);
        }
        Behavior::WrongId => {
            reply.set_id(query.id().wrapping_add(1));
        }
        Behavior::TruncateUdp(_) if over_udp => {
            reply.set_truncated(true);
        }
        Behavior::Answer(ip) | Behavior::TruncateUdp(ip) | Behavior::DuplicateUdp(ip) => {
            for q in query.queries() {
                if q.query_type() == RecordType::A {
                    reply.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(ip))));
                }
            }
        }
    }
    reply.to_vec().ok()
}
