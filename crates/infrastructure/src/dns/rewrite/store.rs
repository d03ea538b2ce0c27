use async_trait::async_trait;
use fdyn_domain::DomainError;

/// Key-value lookup backing the address rewrite. Keys are query names.
#[async_trait]
pub trait AddressStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DomainError>;

    /// Releases pooled connections. Called once at shutdown.
    async fn close(&self) {}
}
