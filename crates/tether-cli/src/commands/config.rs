//! Config command implementation.

use anyhow::{Context, Result};

use tether_core::config::Config;

use super::ConfigArgs;

/// Run the config command.
pub fn run(args: &ConfigArgs) -> Result<()> {
    let path = Config::config_path();
    if args.path {
        println!("{}", path.display());
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
