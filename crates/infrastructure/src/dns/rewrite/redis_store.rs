use super::store::AddressStore;
use async_trait::async_trait;
use fdyn_domain::{DomainError, StoreConfig};
use redis::aio::MultiplexedConnection;
use redis::IntoConnectionInfo;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Redis-backed [`AddressStore`]. The multiplexed connection is opened on
/// first use and dropped after any error so the next lookup reconnects.
pub struct RedisAddressStore {
    client: redis::Client,
    address: String,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisAddressStore {
    pub fn from_config(config: &StoreConfig) -> Result<Self, DomainError> {
        let address = config.address().to_string();
        let mut info = format!("redis://{}/", address)
            .into_connection_info()
            .map_err(|e| DomainError::ConfigError(format!("Invalid store address '{}': {}", address, e)))?;
        info.redis.password = config.password.clone();

        let client = redis::Client::open(info)
            .map_err(|e| DomainError::ConfigError(format!("Invalid store address '{}': {}", address, e)))?;

        Ok(Self {
            client,
            address,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            conn: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connection(&self) -> Result<MultiplexedConnection, DomainError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = bounded(self.connect_timeout, self.client.get_multiplexed_async_connection())
            .await
            .ok_or_else(|| {
                DomainError::StoreError(format!("Connecting to {} timed out", self.address))
            })?
            .map_err(|e| DomainError::StoreError(format!("Connecting to {}: {}", self.address, e)))?;

        debug!(address = %self.address, "Address store connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }
}

/// `None` when the timeout elapsed.
async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[async_trait]
impl AddressStore for RedisAddressStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DomainError> {
        let mut conn = self.connection().await?;

        let mut command = redis::cmd("GET");
        command.arg(key);
        let reply: Option<redis::RedisResult<Option<String>>> =
            bounded(self.read_timeout, command.query_async(&mut conn)).await;

        match reply {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => {
                warn!(address = %self.address, key = %key, error = %e, "Address store lookup failed");
                self.reset().await;
                Err(DomainError::StoreError(format!("GET {}: {}", key, e)))
            }
            None => {
                warn!(address = %self.address, key = %key, "Address store lookup timed out");
                self.reset().await;
                Err(DomainError::StoreError(format!("GET {}: timed out", key)))
            }
        }
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!(address = %self.address, "Address store connection closed");
        }
    }
}
