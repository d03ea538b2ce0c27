use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{info, warn};

/// Fail counter for one upstream. The counter moves up on every failed
/// exchange or probe and back to zero only on a successful probe.
#[derive(Debug, Default)]
pub struct HealthTracker {
    fails: AtomicU32,
    unhealthy: AtomicBool,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_fails == 0` disables health gating.
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails.load(Ordering::Acquire) >= max_fails
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Acquire)
    }

    /// Returns the new fail count.
    pub fn record_failure(&self, upstream: &str, max_fails: u32) -> u32 {
        let fails = self
            .fails
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if max_fails != 0 && fails >= max_fails && !self.unhealthy.swap(true, Ordering::AcqRel) {
            warn!(server = %upstream, fails, "Upstream marked UNHEALTHY");
        }
        fails
    }

    pub fn record_success(&self, upstream: &str) {
        self.fails.store(0, Ordering::Release);
        if self.unhealthy.swap(false, Ordering::AcqRel) {
            info!(server = %upstream, "Upstream marked HEALTHY");
        }
    }
}
