use fdyn_domain::UpstreamPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Stack-allocated enum dispatch for upstream ordering.
pub enum Policy {
    Random,
    RoundRobin { cursor: AtomicUsize },
    Sequential,
}

impl Policy {
    pub fn from_kind(kind: UpstreamPolicy) -> Self {
        match kind {
            UpstreamPolicy::Random => Self::Random,
            UpstreamPolicy::RoundRobin => Self::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            UpstreamPolicy::Sequential => Self::Sequential,
        }
    }

    pub fn kind(&self) -> UpstreamPolicy {
        match self {
            Self::Random => UpstreamPolicy::Random,
            Self::RoundRobin { .. } => UpstreamPolicy::RoundRobin,
            Self::Sequential => UpstreamPolicy::Sequential,
        }
    }

    /// Candidate order for one query. Always contains every upstream.
    pub fn list<T: Clone>(&self, upstreams: &[T]) -> Vec<T> {
        match self {
            Self::Random => {
                let mut order = upstreams.to_vec();
                fastrand::shuffle(&mut order);
                order
            }
            Self::RoundRobin { cursor } => {
                if upstreams.is_empty() {
                    return Vec::new();
                }
                let start = cursor.fetch_add(1, Ordering::Relaxed) % upstreams.len();
                upstreams[start..]
                    .iter()
                    .chain(&upstreams[..start])
                    .cloned()
                    .collect()
            }
            Self::Sequential => upstreams.to_vec(),
        }
    }
}
