pub mod redis_store;
pub mod rewriter;
pub mod store;

pub use redis_store::RedisAddressStore;
pub use rewriter::{lookup_keys, Rewriter};
pub use store::AddressStore;
