use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid domain name: {0}")]
    InvalidDomainName(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid DNS response: {0}")]
    InvalidDnsResponse(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Transport timeout connecting to {server}")]
    TransportTimeout { server: String },

    #[error("Transport connection refused by {server}")]
    TransportConnectionRefused { server: String },

    #[error("Transport connection reset by {server}")]
    TransportConnectionReset { server: String },

    #[error("Cached connection to {server} was closed by peer")]
    CachedConnectionClosed { server: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No healthy upstream servers available")]
    TransportNoHealthyServers,

    #[error("No address store configured")]
    NoAddressStore,

    #[error("Address store error: {0}")]
    StoreError(String),

    #[error("Rewrite failed: {0}")]
    RewriteFailed(String),
}

impl DomainError {
    /// A stale pooled connection; the upstream itself is not suspect.
    pub fn is_stale_connection(&self) -> bool {
        matches!(self, DomainError::CachedConnectionClosed { .. })
    }
}
