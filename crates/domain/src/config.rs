pub mod errors;
pub mod forward;
pub mod logging;
pub mod root;
pub mod server;
pub mod store;

pub use errors::ConfigError;
pub use forward::{ForwardConfig, TlsConfig, MAX_UPSTREAMS};
pub use logging::LoggingConfig;
pub use root::{CliOverrides, Config};
pub use server::ServerConfig;
pub use store::StoreConfig;
