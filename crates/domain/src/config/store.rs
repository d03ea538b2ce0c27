use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_STORE_ADDRESS: &str = "127.0.0.1:6379";

/// Key-value store consulted when an answer carries the unspecified address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// 0 leaves the connect timeout unset.
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// 0 leaves the read timeout unset.
    #[serde(default)]
    pub read_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
            password: None,
            connect_timeout_ms: 0,
            read_timeout_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn address(&self) -> &str {
        match self.address.as_deref() {
            Some(addr) if !addr.trim().is_empty() => addr,
            _ => DEFAULT_STORE_ADDRESS,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

fn default_true() -> bool {
    true
}
