//! Idle connection cache for one upstream.
//!
//! Connections are leased by value: `get` removes the connection from the
//! cache, so a lease is exclusive until the caller hands it back with `put`
//! or drops it. Dropping a [`CachedConnection`] closes the socket and
//! decrements the open-socket gauge exactly once.

use crate::dns::metrics::ForwardMetrics;
use crate::dns::transport::{Connection, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct SocketGuard {
    metrics: ForwardMetrics,
    label: Arc<str>,
}

impl SocketGuard {
    fn new(metrics: ForwardMetrics, label: Arc<str>) -> Self {
        metrics.socket_opened(&label);
        Self { metrics, label }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.metrics.socket_closed(&self.label);
    }
}

pub struct CachedConnection {
    conn: Connection,
    created: Instant,
    id: u64,
    _guard: SocketGuard,
}

impl CachedConnection {
    pub fn new(conn: Connection, metrics: ForwardMetrics, label: Arc<str>) -> Self {
        Self {
            conn,
            created: Instant::now(),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            _guard: SocketGuard::new(metrics, label),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.conn.kind()
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn is_expired(&self, expire: Duration) -> bool {
        self.created.elapsed() >= expire
    }
}

pub struct ConnectionCache {
    idle: [Mutex<Vec<CachedConnection>>; 3],
    expire: Duration,
    capacity: usize,
}

impl ConnectionCache {
    pub fn new(expire: Duration, capacity: usize) -> Self {
        Self {
            idle: std::array::from_fn(|_| Mutex::new(Vec::new())),
            expire,
            capacity,
        }
    }

    fn stack(&self, kind: TransportKind) -> MutexGuard<'_, Vec<CachedConnection>> {
        self.idle[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently returned live connection of `kind`. Expired entries met
    /// on the way are closed.
    pub fn get(&self, kind: TransportKind) -> Option<CachedConnection> {
        let mut expired = Vec::new();
        let found = {
            let mut stack = self.stack(kind);
            loop {
                match stack.pop() {
                    Some(conn) if conn.is_expired(self.expire) => expired.push(conn),
                    other => break other,
                }
            }
        };
        if !expired.is_empty() {
            debug!(kind = kind.as_str(), closed = expired.len(), "Closed expired connections");
        }
        found
    }

    pub fn put(&self, conn: CachedConnection) {
        if conn.is_expired(self.expire) {
            return;
        }
        let mut stack = self.stack(conn.kind());
        if stack.len() < self.capacity {
            stack.push(conn);
        }
    }

    /// Closes every expired idle connection. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        let mut closed = 0;
        for kind in TransportKind::ALL {
            let expired: Vec<CachedConnection> = {
                let mut stack = self.stack(kind);
                let (expired, live): (Vec<_>, Vec<_>) = stack
                    .drain(..)
                    .partition(|conn| conn.is_expired(self.expire));
                *stack = live;
                expired
            };
            closed += expired.len();
        }
        closed
    }

    pub fn idle_count(&self, kind: TransportKind) -> usize {
        self.stack(kind).len()
    }

    pub fn clear(&self) {
        for kind in TransportKind::ALL {
            let drained: Vec<CachedConnection> = self.stack(kind).drain(..).collect();
            drop(drained);
        }
    }
}
