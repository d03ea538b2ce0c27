use anyhow::Context;
use fdyn_domain::{CliOverrides, Config};

pub fn load_config(path: Option<&str>, cli_overrides: CliOverrides) -> anyhow::Result<Config> {
    let config = Config::load(path, cli_overrides).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
