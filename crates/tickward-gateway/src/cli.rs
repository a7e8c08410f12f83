//! CLI definitions for the tickward gateway.

use clap::{Parser, Subcommand};

/// Distributed cron scheduler gateway.
#[derive(Parser)]
#[command(name = "tickward-gateway")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file (default: ~/.tickward/tickward.toml)
    #[arg(short, long, env = "TICKWARD_CONFIG", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler and HTTP API in the foreground (default)
    Run {
        /// Bind address, overrides [gateway].bind
        #[arg(long)]
        bind: Option<String>,

        /// Port, overrides [gateway].port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration and print the resolved task table
    Check,
}
