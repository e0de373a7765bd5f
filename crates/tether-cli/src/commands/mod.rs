//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, defaults are used.
pub fn load_config() -> tether_core::config::Config {
    tether_core::config::Config::load().unwrap_or_default()
}

/// Directory given on the command line, or the current directory.
pub fn repo_dir(repo: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match repo {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

pub mod config;
pub mod git;
pub mod state;

/// Tether - session sync and git snapshot tools
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Capture the git state of a repository
    GitState(GitStateArgs),

    /// Restore a captured git state onto a repository
    GitRestore(GitRestoreArgs),

    /// Show the persisted session state of a workspace
    State(StateArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the git-state command
#[derive(Parser)]
pub struct GitStateArgs {
    /// Repository directory (defaults to the current directory)
    #[arg(short, long)]
    pub repo: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the git-restore command
#[derive(Parser)]
pub struct GitRestoreArgs {
    /// JSON file produced by `tether git-state --json`
    pub file: PathBuf,

    /// Repository directory (defaults to the current directory)
    #[arg(short, long)]
    pub repo: Option<PathBuf>,
}

/// Arguments for the state command
#[derive(Parser)]
pub struct StateArgs {
    /// Workspace state file (defaults to the one for the current directory)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Print only the configuration file path
    #[arg(long)]
    pub path: bool,
}
