use fdyn_domain::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.is_json() {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
