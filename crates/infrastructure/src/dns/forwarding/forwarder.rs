//! Forwarding engine.
//!
//! One query walks an explicit state machine:
//!
//! ```text
//! Selecting -> Attempting -> Validating -> Done
//!     ^            |
//!     +------------+  (transport error, next candidate)
//! ```
//!
//! Selection follows the policy order, skipping upstreams that report down.
//! When every candidate is down the health tracking is assumed broken and
//! one upstream is picked at random. A stale cached connection or a
//! truncated UDP reply (with `prefer_udp`) is retried on the same upstream.
//! A reply that does not match the query ends the run with FORMERR.

use super::response::{error_reply, validate_reply};
use crate::dns::load_balancer::Policy;
use crate::dns::metrics::ForwardMetrics;
use crate::dns::rewrite::{AddressStore, Rewriter};
use crate::dns::transport::{TlsDialer, TransportKind};
use crate::dns::upstream::{AttemptOptions, Upstream};
use fdyn_domain::{DomainError, ForwardConfig};
use futures::future::join_all;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// UDP payload size advertised on queries built by [`Forwarder::lookup`].
const LOOKUP_UDP_PAYLOAD: u16 = 1232;

pub struct Forwarder {
    upstreams: Vec<Arc<Upstream>>,
    policy: Policy,
    rewriter: Rewriter,
    metrics: ForwardMetrics,
    max_fails: u32,
    opts: AttemptOptions,
    timeout: Duration,
    attempt_timeout: Duration,
    health_check_interval: Option<Duration>,
    health_check_timeout: Duration,
    shutdown: CancellationToken,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

enum State {
    Selecting,
    Attempting(Arc<Upstream>),
    Validating(Message),
    Done(Message),
    Exhausted,
}

/// Per-query state. The deadline is fixed when the context is created.
struct QueryContext<'a> {
    request: &'a Message,
    wire: Vec<u8>,
    qname: String,
    client: TransportKind,
    opts: AttemptOptions,
    deadline: Instant,
    candidates: Vec<Arc<Upstream>>,
    cursor: usize,
    fails: usize,
    last_err: Option<DomainError>,
}

impl Forwarder {
    pub fn from_config(
        config: &ForwardConfig,
        store: Option<Arc<dyn AddressStore>>,
    ) -> Result<Self, DomainError> {
        config
            .validate()
            .map_err(|e| DomainError::ConfigError(e.to_string()))?;
        let protocols = config
            .protocols()
            .map_err(|e| DomainError::ConfigError(e.to_string()))?;

        let tls = if protocols.iter().any(|p| p.is_tls()) {
            Some(TlsDialer::from_config(
                &config.tls.clone().unwrap_or_default(),
            )?)
        } else {
            None
        };

        let metrics = ForwardMetrics::new();
        let upstreams = protocols
            .into_iter()
            .map(|protocol| {
                let dialer = protocol.is_tls().then(|| tls.clone()).flatten();
                Arc::new(Upstream::new(protocol, config, dialer, metrics.clone()))
            })
            .collect();

        Ok(Self {
            upstreams,
            policy: Policy::from_kind(config.policy),
            rewriter: Rewriter::new(store),
            metrics,
            max_fails: config.max_fails,
            opts: AttemptOptions::from_config(config),
            timeout: config.timeout(),
            attempt_timeout: config.attempt_timeout(),
            health_check_interval: config.health_check_interval(),
            health_check_timeout: config.health_check_timeout(),
            shutdown: CancellationToken::new(),
            probes: Mutex::new(Vec::new()),
        })
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn metrics(&self) -> &ForwardMetrics {
        &self.metrics
    }

    /// Spawns one probe loop per upstream.
    pub fn start(&self) {
        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        for upstream in &self.upstreams {
            if let Some(handle) = upstream.start(
                self.health_check_interval,
                self.health_check_timeout,
                self.opts,
                self.shutdown.child_token(),
            ) {
                probes.push(handle);
            }
        }
        info!(
            upstreams = self.upstreams.len(),
            policy = %self.policy.kind(),
            interval_ms = self.health_check_interval.map(|d| d.as_millis() as u64),
            rewrite_store = self.rewriter.has_store(),
            "Forwarder started"
        );
    }

    /// Stops every probe loop, waits for them to exit, then releases the
    /// address store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let probes: Vec<_> = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let stopped = probes.len();

        for result in join_all(probes).await {
            if let Err(e) = result {
                warn!(error = %e, "Probe task ended abnormally");
            }
        }

        self.rewriter.close().await;
        info!(probes = stopped, "Forwarder stopped");
    }

    /// Forwards `request` and returns the reply to send back. `Err` means
    /// no upstream produced a usable answer before the deadline.
    pub async fn forward(
        &self,
        request: &Message,
        client: TransportKind,
    ) -> Result<Message, DomainError> {
        let Some(question) = request.queries().first() else {
            return Ok(error_reply(request, ResponseCode::FormErr));
        };
        let wire = request
            .to_vec()
            .map_err(|e| DomainError::InvalidDnsResponse(format!("Failed to encode query: {}", e)))?;

        let mut ctx = QueryContext {
            request,
            wire,
            qname: question.name().to_ascii(),
            client,
            opts: self.opts,
            deadline: Instant::now() + self.timeout,
            candidates: self.policy.list(&self.upstreams),
            cursor: 0,
            fails: 0,
            last_err: None,
        };

        let mut state = State::Selecting;
        loop {
            state = match state {
                State::Selecting => self.select(&mut ctx),
                State::Attempting(upstream) => self.attempt(&mut ctx, upstream).await,
                State::Validating(reply) => self.validate(&ctx, reply).await,
                State::Done(reply) => return Ok(reply),
                State::Exhausted => {
                    debug!(qname = %ctx.qname, "All upstream attempts failed");
                    return Err(ctx
                        .last_err
                        .unwrap_or(DomainError::TransportNoHealthyServers));
                }
            };
        }
    }

    /// Builds a recursive query for `name`/`rtype` and sends it through the
    /// same selection and failover as [`Forwarder::forward`].
    pub async fn lookup(&self, name: &str, rtype: RecordType) -> Result<Message, DomainError> {
        let mut fqdn = Name::from_ascii(name)
            .map_err(|e| DomainError::InvalidDomainName(format!("{}: {}", name, e)))?;
        fqdn.set_fqdn(true);

        let mut edns = Edns::new();
        edns.set_max_payload(LOOKUP_UDP_PAYLOAD);

        let mut request = Message::new();
        request
            .set_id(fastrand::u16(..))
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_edns(edns);
        request.add_query(Query::query(fqdn, rtype));

        self.forward(&request, TransportKind::Udp).await
    }

    fn select(&self, ctx: &mut QueryContext<'_>) -> State {
        let n = ctx.candidates.len();
        if n == 0 || Instant::now() >= ctx.deadline {
            return State::Exhausted;
        }

        loop {
            if ctx.cursor >= n {
                ctx.cursor = 0;
                ctx.fails = 0;
            }
            let candidate = &ctx.candidates[ctx.cursor];
            ctx.cursor += 1;

            if !candidate.down(self.max_fails) {
                return State::Attempting(Arc::clone(candidate));
            }

            ctx.fails += 1;
            if ctx.fails >= n {
                let pick = Arc::clone(&ctx.candidates[fastrand::usize(..n)]);
                self.metrics.record_healthcheck_broken();
                warn!(server = %pick.label(), "All upstreams are down, health checking may be broken; trying one at random");
                return State::Attempting(pick);
            }
        }
    }

    async fn attempt(&self, ctx: &mut QueryContext<'_>, upstream: Arc<Upstream>) -> State {
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return State::Exhausted;
        }
        let per_attempt = self.attempt_timeout.min(remaining);

        let result = tokio::time::timeout(
            remaining,
            upstream.send(&ctx.wire, ctx.opts, ctx.client, per_attempt),
        )
        .await
        .unwrap_or_else(|_| {
            upstream.record_failure();
            Err(DomainError::TransportTimeout {
                server: upstream.label().to_string(),
            })
        });

        match result {
            Ok(reply) if reply.truncated() && !ctx.opts.force_tcp && ctx.opts.prefer_udp => {
                debug!(server = %upstream.label(), qname = %ctx.qname, "Truncated reply, retrying over TCP");
                ctx.opts.force_tcp = true;
                State::Attempting(upstream)
            }
            Ok(reply) => State::Validating(reply),
            Err(e) if e.is_stale_connection() => {
                debug!(server = %upstream.label(), "Cached connection closed by peer, retrying");
                State::Attempting(upstream)
            }
            Err(e) => {
                warn!(server = %upstream.label(), qname = %ctx.qname, error = %e, "Upstream attempt failed");
                if self.max_fails != 0 {
                    upstream.healthcheck();
                }
                ctx.last_err = Some(e);
                if ctx.fails < ctx.candidates.len() {
                    State::Selecting
                } else {
                    State::Exhausted
                }
            }
        }
    }

    async fn validate(&self, ctx: &QueryContext<'_>, mut reply: Message) -> State {
        if let Err(reason) = validate_reply(ctx.request, &reply) {
            warn!(qname = %ctx.qname, reason = %reason, "Upstream reply does not match query");
            return State::Done(error_reply(ctx.request, ResponseCode::FormErr));
        }

        match self.rewriter.rewrite(&mut reply, &ctx.qname).await {
            Ok(_) => State::Done(reply),
            Err(e) => {
                warn!(qname = %ctx.qname, error = %e, "Address rewrite failed");
                State::Done(error_reply(ctx.request, ResponseCode::FormErr))
            }
        }
    }
}
