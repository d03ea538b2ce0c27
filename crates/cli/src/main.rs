use anyhow::Context;
use clap::Parser;
use fdyn_domain::{CliOverrides, ForwardZone};
use fdyn_infrastructure::dns::{AddressStore, DnsServerHandler, Forwarder, RedisAddressStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod bootstrap;
mod server;

#[derive(Parser)]
#[command(name = "fdyn")]
#[command(version)]
#[command(about = "fdyn - DNS forwarder with health-checked upstreams and dynamic address rewrite")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// DNS server port
    #[arg(short = 'd', long)]
    dns_port: Option<u16>,

    /// Bind address
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cli_overrides = CliOverrides {
        dns_port: cli.dns_port,
        bind_address: cli.bind.clone(),
        log_level: cli.log_level.clone(),
    };
    let config = bootstrap::load_config(cli.config.as_deref(), cli_overrides)?;

    bootstrap::init_logging(&config.logging);
    info!("Starting fdyn v{}", env!("CARGO_PKG_VERSION"));

    let store: Option<Arc<dyn AddressStore>> = if config.store.enabled {
        let store = RedisAddressStore::from_config(&config.store)?;
        info!(address = %store.address(), "Address store configured");
        Some(Arc::new(store))
    } else {
        None
    };

    let forwarder = Arc::new(
        Forwarder::from_config(&config.forward, store).context("Failed to build forwarder")?,
    );
    forwarder.start();

    let zone = ForwardZone::new(&config.forward.from, &config.forward.except);
    info!(zone = %zone.from(), excluded = zone.except().len(), "Forward zone");
    let handler = Arc::new(DnsServerHandler::new(forwarder.clone(), zone));

    let shutdown = CancellationToken::new();
    let mut dns_server = tokio::spawn(server::start_dns_server(
        config.server.listen_addr(),
        handler,
        Duration::from_millis(config.server.tcp_idle_timeout_ms),
        shutdown.clone(),
    ));

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            None
        }
        result = &mut dns_server => Some(result),
    };
    let server_result = match finished {
        Some(result) => result,
        None => {
            shutdown.cancel();
            dns_server.await
        }
    };

    forwarder.shutdown().await;

    match server_result {
        Ok(Ok(())) => {
            info!("Server shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "DNS server error");
            Err(e)
        }
        Err(e) => Err(e).context("DNS server task failed"),
    }
}
