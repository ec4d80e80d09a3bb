//! CLI command handling.
//!
//! Provides subcommands for:
//! - Printing the effective configuration (`config`)
//! - Running two in-process domains over a loopback link (`loopback`)

mod loopback;

pub use loopback::{LoopbackArgs, LoopbackReport, ModeArg, TransportArg, run_loopback_command};

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::ProxyConfig;

#[derive(Parser, Debug)]
#[command(name = "domainlink")]
#[command(about = "Mirror publish/subscribe channels between compute domains")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path (JSON; environment variables still apply)
    #[arg(short, long, global = true, env = "DOMAINLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as JSON
    Config,

    /// Forward messages between two in-process domains
    Loopback(LoopbackArgs),
}

/// Resolve the configuration: file (or defaults), then `DOMAINLINK_*`.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ProxyConfig> {
    let _ = dotenvy::dotenv();
    let mut config = match path {
        Some(path) => ProxyConfig::load_from(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => ProxyConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Run the `config` command.
pub fn run_config_command(config: &ProxyConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
