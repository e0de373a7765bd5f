//! Tether CLI - inspect session sync state and git snapshots
//!
//! The sync engine itself runs inside a host application; this binary
//! exposes the parts that are useful from a terminal.
//!
//! ## Quick Start
//!
//! ```bash
//! # Capture the git state of the current repository
//! tether git-state --json > state.json
//!
//! # Replay it on another checkout
//! tether git-restore state.json --repo ../other-checkout
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::GitState(args) => commands::git::run_state(args).await,
        Command::GitRestore(args) => commands::git::run_restore(args).await,
        Command::State(args) => commands::state::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tether=info,tether_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
