use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::ConfigError;
use crate::dns_protocol::DnsProtocol;
use crate::policy::UpstreamPolicy;

/// Maximum number of upstreams a single forwarder accepts.
pub const MAX_UPSTREAMS: usize = 15;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Origin zone this forwarder answers for.
    #[serde(default = "default_from")]
    pub from: String,

    #[serde(default)]
    pub to: Vec<String>,

    #[serde(default)]
    pub except: Vec<String>,

    /// Fails before an upstream counts as down. 0 disables health gating.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Probe loop period. 0 disables periodic probing; error-triggered
    /// probes still run.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,

    #[serde(default)]
    pub force_tcp: bool,

    #[serde(default)]
    pub prefer_udp: bool,

    /// Cached upstream connections older than this are closed.
    #[serde(default = "default_expire")]
    pub expire_secs: u64,

    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,

    #[serde(default)]
    pub policy: UpstreamPolicy,

    /// Whole-query deadline, retries included.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Bound on a single dial/write/read against one upstream.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    /// PEM bundle of trust roots; the bundled web PKI roots are used when unset.
    #[serde(default)]
    pub ca_file: Option<String>,

    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            from: default_from(),
            to: vec![],
            except: vec![],
            max_fails: default_max_fails(),
            health_check_interval_ms: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            force_tcp: false,
            prefer_udp: false,
            expire_secs: default_expire(),
            max_idle_connections: default_max_idle_connections(),
            policy: UpstreamPolicy::default(),
            timeout_ms: default_timeout(),
            attempt_timeout_ms: default_attempt_timeout(),
            tls: None,
        }
    }
}

impl ForwardConfig {
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn protocols(&self) -> Result<Vec<DnsProtocol>, ConfigError> {
        self.to
            .iter()
            .map(|s| {
                s.parse::<DnsProtocol>()
                    .map_err(|e| ConfigError::Validation(format!("Invalid upstream '{}': {}", s, e)))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.from.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Forward origin cannot be empty".to_string(),
            ));
        }
        if self.to.is_empty() {
            return Err(ConfigError::Validation(
                "No upstream servers configured".to_string(),
            ));
        }
        if self.to.len() > MAX_UPSTREAMS {
            return Err(ConfigError::Validation(format!(
                "more than {} upstreams configured: {}",
                MAX_UPSTREAMS,
                self.to.len()
            )));
        }
        self.protocols()?;

        if self.force_tcp && self.prefer_udp {
            return Err(ConfigError::Validation(
                "force_tcp and prefer_udp are mutually exclusive".to_string(),
            ));
        }
        if self.timeout_ms == 0 || self.attempt_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.health_check_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "health_check_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigError::Validation(
                    "tls cert_file and key_file must be set together".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_from() -> String {
    ".".to_string()
}

fn default_max_fails() -> u32 {
    2
}

fn default_health_check_interval() -> u64 {
    500
}

fn default_health_check_timeout() -> u64 {
    1000
}

fn default_expire() -> u64 {
    10
}

fn default_max_idle_connections() -> usize {
    16
}

fn default_timeout() -> u64 {
    5000
}

fn default_attempt_timeout() -> u64 {
    2000
}
