pub mod connection_cache;
pub mod health;

pub use connection_cache::{CachedConnection, ConnectionCache};
pub use health::HealthTracker;

use crate::dns::metrics::ForwardMetrics;
use crate::dns::transport::{is_peer_closed, map_io_error, Connection, TlsDialer, TransportKind};
use fdyn_domain::{DnsProtocol, DomainError, ForwardConfig};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-attempt transport flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptOptions {
    pub force_tcp: bool,
    pub prefer_udp: bool,
}

impl AttemptOptions {
    pub fn from_config(config: &ForwardConfig) -> Self {
        Self {
            force_tcp: config.force_tcp,
            prefer_udp: config.prefer_udp,
        }
    }
}

/// One configured destination: its connection cache, fail counter and the
/// trigger feeding its probe loop.
pub struct Upstream {
    protocol: DnsProtocol,
    label: Arc<str>,
    tls: Option<TlsDialer>,
    cache: ConnectionCache,
    health: HealthTracker,
    max_fails: u32,
    metrics: ForwardMetrics,
    probe_tx: mpsc::Sender<()>,
    probe_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Upstream {
    pub fn new(
        protocol: DnsProtocol,
        config: &ForwardConfig,
        tls: Option<TlsDialer>,
        metrics: ForwardMetrics,
    ) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel(1);
        Self {
            protocol,
            label: Arc::from(protocol.to_string()),
            tls,
            cache: ConnectionCache::new(config.expire(), config.max_idle_connections),
            health: HealthTracker::new(),
            max_fails: config.max_fails,
            metrics,
            probe_tx,
            probe_rx: Mutex::new(Some(probe_rx)),
        }
    }

    pub fn protocol(&self) -> &DnsProtocol {
        &self.protocol
    }

    pub fn label(&self) -> &Arc<str> {
        &self.label
    }

    pub fn addr(&self) -> SocketAddr {
        self.protocol.socket_addr()
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn down(&self, max_fails: u32) -> bool {
        self.health.down(max_fails)
    }

    pub fn record_failure(&self) {
        self.health.record_failure(&self.label, self.max_fails);
    }

    /// Transport used for one attempt against this upstream.
    pub fn transport_for(&self, opts: AttemptOptions, client: TransportKind) -> TransportKind {
        match self.protocol {
            DnsProtocol::Tls { .. } => TransportKind::Tls,
            DnsProtocol::Tcp { .. } => TransportKind::Tcp,
            DnsProtocol::Udp { .. } => {
                if opts.force_tcp || (client != TransportKind::Udp && !opts.prefer_udp) {
                    TransportKind::Tcp
                } else {
                    TransportKind::Udp
                }
            }
        }
    }

    /// Sends an encoded query and returns the decoded reply. Any failure
    /// other than a stale cached connection counts against the upstream.
    pub async fn send(
        &self,
        request: &[u8],
        opts: AttemptOptions,
        client: TransportKind,
        timeout: Duration,
    ) -> Result<Message, DomainError> {
        let kind = self.transport_for(opts, client);
        let start = Instant::now();

        match self.exchange(request, kind, timeout).await {
            Ok(reply) => {
                self.metrics.record_exchange(
                    &self.label,
                    u16::from(reply.response_code()),
                    start.elapsed(),
                );
                Ok(reply)
            }
            Err(e) => {
                if !e.is_stale_connection() {
                    debug!(server = %self.label, transport = kind.as_str(), error = %e, "Exchange failed");
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        request: &[u8],
        kind: TransportKind,
        timeout: Duration,
    ) -> Result<Message, DomainError> {
        let (mut conn, reused) = match self.cache.get(kind) {
            Some(conn) => (conn, true),
            None => {
                let conn = Connection::dial(kind, self.addr(), self.tls.as_ref(), timeout).await?;
                (
                    CachedConnection::new(conn, self.metrics.clone(), self.label.clone()),
                    false,
                )
            }
        };

        let bytes = match conn.connection_mut().exchange(request, timeout).await {
            Ok(bytes) => bytes,
            Err(e) if reused && is_peer_closed(&e) => {
                return Err(DomainError::CachedConnectionClosed {
                    server: self.label.to_string(),
                })
            }
            Err(e) => return Err(map_io_error(e, self.addr())),
        };

        let reply = Message::from_vec(&bytes).map_err(|e| {
            DomainError::InvalidDnsResponse(format!("{}: {}", self.label, e))
        })?;

        // A reply for another query means the channel is out of step; the
        // connection is closed instead of cached.
        if request.get(..2) == Some(&reply.id().to_be_bytes()[..]) {
            self.cache.put(conn);
        } else {
            debug!(server = %self.label, transport = kind.as_str(), reply_id = reply.id(), "Discarding connection after mismatched reply");
        }
        Ok(reply)
    }

    /// Inband liveness check: `. IN NS` through the same connection path as
    /// real queries. Any well-formed reply to the check itself is a success,
    /// whatever its rcode.
    pub async fn probe(&self, timeout: Duration, opts: AttemptOptions) -> Result<(), DomainError> {
        let (id, query) = probe_query()?;
        let kind = self.transport_for(opts, TransportKind::Udp);

        let attempt = async {
            let reply = match self.exchange(&query, kind, timeout).await {
                Err(e) if e.is_stale_connection() => self.exchange(&query, kind, timeout).await,
                other => other,
            }?;
            if reply.id() != id {
                return Err(DomainError::InvalidDnsResponse(format!(
                    "{}: reply id {} does not match {}",
                    self.label,
                    reply.id(),
                    id
                )));
            }
            Ok(reply)
        };
        let result = tokio::time::timeout(timeout, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(DomainError::TransportTimeout {
                    server: self.label.to_string(),
                })
            });

        match result {
            Ok(_) => {
                self.health.record_success(&self.label);
                Ok(())
            }
            Err(e) => {
                debug!(server = %self.label, error = %e, "Health probe failed");
                self.record_failure();
                self.metrics.record_healthcheck_failure(&self.label);
                Err(e)
            }
        }
    }

    /// Asks the probe loop for an immediate probe. Dropped when one is
    /// already queued.
    pub fn healthcheck(&self) {
        if let Err(mpsc::error::TrySendError::Closed(())) = self.probe_tx.try_send(()) {
            debug!(server = %self.label, "Probe loop not running");
        }
    }

    /// Spawns the probe loop. Returns `None` when the loop was already
    /// started for this upstream.
    pub fn start(
        self: &Arc<Self>,
        interval: Option<Duration>,
        probe_timeout: Duration,
        opts: AttemptOptions,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut trigger = self
            .probe_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let upstream = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = interval.map(|period| {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = next_tick(&mut ticker) => {
                        let closed = upstream.cache.sweep();
                        if closed > 0 {
                            debug!(server = %upstream.label, closed, "Swept expired connections");
                        }
                        let _ = upstream.probe(probe_timeout, opts).await;
                    }
                    Some(()) = trigger.recv() => {
                        if upstream.probe(probe_timeout, opts).await.is_err()
                            && upstream.down(upstream.max_fails)
                        {
                            warn!(server = %upstream.label, fails = upstream.health.fails(), "Upstream still failing probes");
                        }
                    }
                }
            }

            upstream.cache.clear();
            debug!(server = %upstream.label, "Probe loop stopped");
        }))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn probe_query() -> Result<(u16, Vec<u8>), DomainError> {
    let id = fastrand::u16(..);
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::root(), RecordType::NS));
    let bytes = message
        .to_vec()
        .map_err(|e| DomainError::InvalidDnsResponse(format!("Failed to encode probe: {}", e)))?;
    Ok((id, bytes))
}
