//! Fdyn Domain Layer
pub mod config;
pub mod dns_protocol;
pub mod errors;
pub mod forward_zone;
pub mod policy;

pub use config::{
    CliOverrides, Config, ConfigError, ForwardConfig, LoggingConfig, ServerConfig, StoreConfig,
    TlsConfig, MAX_UPSTREAMS,
};
pub use dns_protocol::DnsProtocol;
pub use errors::DomainError;
pub use forward_zone::ForwardZone;
pub use policy::UpstreamPolicy;
