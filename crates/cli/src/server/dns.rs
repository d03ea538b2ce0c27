use fdyn_infrastructure::dns::transport::tcp::{read_with_length_prefix, send_with_length_prefix};
use fdyn_infrastructure::dns::transport::is_peer_closed;
use fdyn_infrastructure::dns::{DnsServerHandler, TransportKind};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_UDP_QUERY_SIZE: usize = 65535;

/// Serves UDP and TCP on `bind_addr` until `shutdown` fires.
pub async fn start_dns_server(
    bind_addr: String,
    handler: Arc<DnsServerHandler>,
    tcp_idle_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let socket_addr: SocketAddr = bind_addr.parse()?;
    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let udp_socket = Arc::new(create_udp_socket(domain, socket_addr)?);
    let tcp_listener = create_tcp_listener(domain, socket_addr)?;

    let mut join_set: JoinSet<()> = JoinSet::new();
    join_set.spawn(run_udp_worker(udp_socket, handler.clone(), shutdown.clone()));
    join_set.spawn(run_tcp_acceptor(
        tcp_listener,
        handler,
        tcp_idle_timeout,
        shutdown.clone(),
    ));

    info!(bind_address = %socket_addr, "DNS server ready");

    while join_set.join_next().await.is_some() {}
    info!("DNS server stopped");
    Ok(())
}

async fn run_udp_worker(
    socket: Arc<UdpSocket>,
    handler: Arc<DnsServerHandler>,
    shutdown: CancellationToken,
) {
    let mut recv_buf = vec![0u8; MAX_UDP_QUERY_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut recv_buf) => match result {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "UDP recv error");
                    continue;
                }
            },
        };

        let query: Arc<[u8]> = Arc::from(&recv_buf[..n]);
        let handler = handler.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Some(response) = handler.handle(&query, TransportKind::Udp).await {
                if let Err(e) = socket.send_to(&response, from).await {
                    debug!(client = %from, error = %e, "UDP send failed");
                }
            }
        });
    }
}

async fn run_tcp_acceptor(
    listener: TcpListener,
    handler: Arc<DnsServerHandler>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            },
        };

        tokio::spawn(serve_tcp_client(
            stream,
            peer,
            handler.clone(),
            idle_timeout,
            shutdown.clone(),
        ));
    }
}

async fn serve_tcp_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<DnsServerHandler>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let query = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(idle_timeout, read_with_length_prefix(&mut stream)) => match read {
                Ok(Ok(query)) => query,
                Ok(Err(e)) => {
                    if !is_peer_closed(&e) {
                        debug!(client = %peer, error = %e, "TCP read failed");
                    }
                    break;
                }
                Err(_) => {
                    debug!(client = %peer, "TCP client idle, closing");
                    break;
                }
            },
        };

        let Some(response) = handler.handle(&query, TransportKind::Tcp).await else {
            continue;
        };
        if let Err(e) = send_with_length_prefix(&mut stream, &response).await {
            debug!(client = %peer, error = %e, "TCP write failed");
            break;
        }
    }
}

fn create_udp_socket(domain: Domain, socket_addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if socket_addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(512 * 1024)?;
    socket.set_send_buffer_size(512 * 1024)?;
    socket.bind(&socket_addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn create_tcp_listener(domain: Domain, socket_addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if socket_addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
