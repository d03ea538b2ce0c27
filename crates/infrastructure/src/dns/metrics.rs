use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-upstream forwarding counters. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct ForwardMetrics {
    requests: Arc<DashMap<Arc<str>, u64>>,

    rcodes: Arc<DashMap<(Arc<str>, u16), u64>>,

    /// (total microseconds, samples)
    durations: Arc<DashMap<Arc<str>, (u64, u64)>>,

    healthcheck_failures: Arc<DashMap<Arc<str>, u64>>,

    healthcheck_broken: Arc<AtomicU64>,

    sockets: Arc<DashMap<Arc<str>, i64>>,
}

impl ForwardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&self, upstream: &Arc<str>, rcode: u16, elapsed: Duration) {
        self.requests
            .entry(upstream.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1);

        self.rcodes
            .entry((upstream.clone(), rcode))
            .and_modify(|c| *c += 1)
            .or_insert(1);

        let micros = elapsed.as_micros() as u64;
        self.durations
            .entry(upstream.clone())
            .and_modify(|(total, count)| {
                *total += micros;
                *count += 1;
            })
            .or_insert((micros, 1));
    }

    pub fn record_healthcheck_failure(&self, upstream: &Arc<str>) {
        self.healthcheck_failures
            .entry(upstream.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn record_healthcheck_broken(&self) {
        self.healthcheck_broken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_opened(&self, upstream: &Arc<str>) {
        *self.sockets.entry(upstream.clone()).or_insert(0) += 1;
    }

    pub fn socket_closed(&self, upstream: &Arc<str>) {
        *self.sockets.entry(upstream.clone()).or_insert(0) -= 1;
    }

    pub fn requests(&self, upstream: &str) -> u64 {
        self.requests.get(upstream).map(|c| *c).unwrap_or(0)
    }

    pub fn rcode_count(&self, upstream: &str, rcode: u16) -> u64 {
        self.rcodes
            .get(&(Arc::from(upstream), rcode))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn average_duration(&self, upstream: &str) -> Option<Duration> {
        self.durations
            .get(upstream)
            .filter(|entry| entry.1 > 0)
            .map(|entry| Duration::from_micros(entry.0 / entry.1))
    }

    pub fn healthcheck_failures(&self, upstream: &str) -> u64 {
        self.healthcheck_failures
            .get(upstream)
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn healthcheck_broken(&self) -> u64 {
        self.healthcheck_broken.load(Ordering::Relaxed)
    }

    pub fn open_sockets(&self, upstream: &str) -> i64 {
        self.sockets.get(upstream).map(|c| *c).unwrap_or(0)
    }

    pub fn total_open_sockets(&self) -> i64 {
        self.sockets.iter().map(|entry| *entry.value()).sum()
    }
}
