pub mod forwarding;
pub mod load_balancer;
pub mod metrics;
pub mod rewrite;
pub mod server;
pub mod transport;
pub mod upstream;

pub use forwarding::Forwarder;
pub use load_balancer::Policy;
pub use metrics::ForwardMetrics;
pub use rewrite::{AddressStore, RedisAddressStore, Rewriter};
pub use server::DnsServerHandler;
pub use transport::TransportKind;
pub use upstream::{AttemptOptions, Upstream};
