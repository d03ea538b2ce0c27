use fdyn_domain::{DnsProtocol, DomainError};
use fdyn_infrastructure::dns::{AttemptOptions, Forwarder, ForwardMetrics, TransportKind, Upstream};
use hickory_proto::rr::RecordType;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

mod helpers;
use helpers::{forward_config, plain, query, tcp, Behavior, MockDnsServer};

const ANSWER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const TIMEOUT: Duration = Duration::from_millis(300);

fn upstream(endpoint: String) -> (Arc<Upstream>, ForwardMetrics) {
    let config = forward_config(&[endpoint.clone()]);
    let protocol: DnsProtocol = endpoint.parse().unwrap();
    let metrics = ForwardMetrics::new();
    let upstream = Arc::new(Upstream::new(protocol, &config, None, metrics.clone()));
    (upstream, metrics)
}

fn wire(name: &str) -> Vec<u8> {
    query(name, RecordType::A).to_vec().unwrap()
}

#[tokio::test]
async fn test_tcp_connection_is_reused() {
    let server = MockDnsServer::start(Behavior::Answer(ANSWER)).await.unwrap();
    let (upstream, metrics) = upstream(tcp(server.addr()));
    let opts = AttemptOptions::default();

    upstream.send(&wire("a.example."), opts, TransportKind::Udp, TIMEOUT).await.unwrap();
    upstream.send(&wire("b.example."), opts, TransportKind::Udp, TIMEOUT).await.unwrap();

    assert_eq!(server.tcp_connections(), 1);
    assert_eq!(server.tcp_queries(), 2);
    assert_eq!(upstream.cache().idle_count(TransportKind::Tcp), 1);
    assert_eq!(metrics.open_sockets(upstream.label()), 1);
}

#[tokio::test]
async fn test_stale_cached_connection_is_not_a_failure() {
    let server = MockDnsServer::start_closing_tcp(Behavior::Answer(ANSWER)).await.unwrap();
    let (upstream, _) = upstream(tcp(server.addr()));
    let opts = AttemptOptions::default();

    upstream.send(&wire("a.example."), opts, TransportKind::Udp, TIMEOUT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = upstream.send(&wire("b.example."), opts, TransportKind::Udp, TIMEOUT).await;

    assert!(matches!(result, Err(DomainError::CachedConnectionClosed { .. })));
    assert_eq!(upstream.health().fails(), 0);
}

#[tokio::test]
async fn test_forwarder_retries_stale_connection() {
    let server = MockDnsServer::start_closing_tcp(Behavior::Answer(ANSWER)).await.unwrap();
    let forwarder = Forwarder::from_config(&forward_config(&[tcp(server.addr())]), None).unwrap();

    for name in ["a.example.", "b.example."] {
        forwarder
            .forward(&query(name, RecordType::A), TransportKind::Udp)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(server.tcp_connections(), 2);
    assert_eq!(forwarder.upstreams()[0].health().fails(), 0);
}

#[tokio::test]
async fn test_failed_exchange_is_recorded() {
    let server = MockDnsServer::start(Behavior::Silent).await.unwrap();
    let (upstream, metrics) = upstream(plain(server.addr()));

    let result = upstream
        .send(&wire("a.example."), AttemptOptions::default(), TransportKind::Udp, TIMEOUT)
        .await;

    assert!(matches!(result, Err(DomainError::TransportTimeout { .. })));
    assert_eq!(upstream.health().fails(), 1);
    assert_eq!(upstream.cache().idle_count(TransportKind::Udp), 0);
    assert_eq!(metrics.open_sockets(upstream.label()), 0);
}

#[tokio::test]
async fn test_probe_success_resets_fails() {
    let server = MockDnsServer::start(Behavior::Answer(ANSWER)).await.unwrap();
    let (upstream, _) = upstream(plain(server.addr()));
    upstream.record_failure();
    upstream.record_failure();
    assert!(upstream.down(2));

    upstream.probe(TIMEOUT, AttemptOptions::default()).await.unwrap();

    assert_eq!(upstream.health().fails(), 0);
    assert!(!upstream.down(2));
    assert_eq!(server.udp_queries(), 1);
}

#[tokio::test]
async fn test_probe_accepts_any_rcode() {
    let server = MockDnsServer::start(Behavior::ServFail).await.unwrap();
    let (upstream, _) = upstream(plain(server.addr()));
    upstream.record_failure();

    assert!(upstream.probe(TIMEOUT, AttemptOptions::default()).await.is_ok());
    assert_eq!(upstream.health().fails(), 0);
}

#[tokio::test]
async fn test_probe_failure_counts() {
    let server = MockDnsServer::start(Behavior::Silent).await.unwrap();
    let (upstream, metrics) = upstream(plain(server.addr()));

    assert!(upstream.probe(TIMEOUT, AttemptOptions::default()).await.is_err());

    assert_eq!(upstream.health().fails(), 1);
    assert_eq!(metrics.healthcheck_failures(upstream.label()), 1);
}

#[tokio::test]
async fn test_health_check_rejects_reply_for_another_query() {
    let server = MockDnsServer::start(Behavior::WrongId).await.unwrap();
    let (upstream, metrics) = upstream(tcp(server.addr()));

    let result = upstream.probe(TIMEOUT, AttemptOptions::default()).await;

    assert!(matches!(result, Err(DomainError::InvalidDnsResponse(_))));
    assert_eq!(upstream.health().fails(), 1);
    assert_eq!(metrics.healthcheck_failures(upstream.label()), 1);
    assert_eq!(upstream.cache().idle_count(TransportKind::Tcp), 0);
}

#[tokio::test]
async fn test_health_check_ignores_udp_reply_with_wrong_id() {
    let server = MockDnsServer::start(Behavior::WrongId).await.unwrap();
    let (upstream, _) = upstream(plain(server.addr()));

    assert!(upstream.probe(TIMEOUT, AttemptOptions::default()).await.is_err());
    assert_eq!(upstream.health().fails(), 1);
}

#[tokio::test]
async fn test_mismatched_tcp_reply_discards_connection() {
    let server = MockDnsServer::start(Behavior::WrongId).await.unwrap();
    let (upstream, metrics) = upstream(tcp(server.addr()));

    let request = wire("a.example.");
    let reply = upstream
        .send(&request, AttemptOptions::default(), TransportKind::Udp, TIMEOUT)
        .await
        .unwrap();

    assert_ne!(reply.id().to_be_bytes(), [request[0], request[1]]);
    assert_eq!(upstream.cache().idle_count(TransportKind::Tcp), 0);
    assert_eq!(metrics.open_sockets(upstream.label()), 0);
}

#[tokio::test]
async fn test_healthcheck_trigger_runs_probe() {
    let server = MockDnsServer::start(Behavior::Answer(ANSWER)).await.unwrap();
    let (upstream, _) = upstream(plain(server.addr()));
    upstream.record_failure();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = upstream
        .start(None, TIMEOUT, AttemptOptions::default(), shutdown.clone())
        .unwrap();

    upstream.healthcheck();
    upstream.healthcheck();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(upstream.health().fails(), 0);
    assert!(server.udp_queries() >= 1 && server.udp_queries() <= 2);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_periodic_probe_marks_silent_upstream_down() {
    let server = MockDnsServer::start(Behavior::Silent).await.unwrap();
    let (upstream, _) = upstream(plain(server.addr()));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = upstream
        .start(
            Some(Duration::from_millis(30)),
            Duration::from_millis(50),
            AttemptOptions::default(),
            shutdown.clone(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(upstream.down(2));

    server.set_behavior(Behavior::Answer(ANSWER));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!upstream.down(2));

    shutdown.cancel();
    handle.await.unwrap();
}
