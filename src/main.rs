//! # rdi-updater
//!
//! Keeps locally installed artifacts in sync with their published versions.
//!
//! Features:
//! - Artifacts are listed in `$(rdi-updater home)/config.toml`
//! - `rdi-updater check` reports which artifacts are current, outdated or missing
//! - `rdi-updater update` downloads, verifies and installs new versions
//! - `rdi-updater digest` prints the SHA-256 of a file
//! - `rdi-updater home` prints the updater home directory
//!
//! Diagnostics go to stderr and are filtered by `RDI_UPDATER_LOG`
//! (e.g. `RDI_UPDATER_LOG=debug`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use rdi_updater::{UpdateOptions, cmd_check, cmd_digest, cmd_update, paths};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Command-line interface definition.
#[derive(Parser, Debug)]
#[command(
    name = "rdi-updater",
    version,
    about = "rdi-updater - verified, recoverable artifact updates",
    arg_required_else_help = true
)]
struct Cli {
    /// Use this config file instead of the one in the updater home
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show which artifacts need an update (downloads nothing)
    Check {
        /// Only this artifact
        #[arg(long, value_name = "NAME")]
        only: Option<String>,
    },
    /// Download and install new versions of configured artifacts
    Update {
        /// Re-run a session this many more times after a retryable failure
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Only this artifact
        #[arg(long, value_name = "NAME")]
        only: Option<String>,
    },
    /// Print the SHA-256 digest of a file
    Digest { path: PathBuf },
    /// Print the updater home directory
    Home,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("RDI_UPDATER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// CLI entry point.
fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Check { only } => cmd_check(cli.config.as_deref(), only.as_deref()),
        Cmd::Update { retries, only } => cmd_update(&UpdateOptions {
            config: cli.config,
            retries,
            only,
        }),
        Cmd::Digest { path } => cmd_digest(&path),
        Cmd::Home => {
            println!("{}", paths(cli.config.as_deref())?.home.display());
            Ok(())
        }
    }
}
