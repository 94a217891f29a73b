//! CLI command definitions for the `conveyor` binary.

pub mod demo;
pub mod report;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use conveyor_core::config::CONFIG_FILE_NAME;

/// Run workflows on the Conveyor engine.
#[derive(Parser)]
#[command(name = "conveyor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, env = "CONVEYOR_CONFIG", default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for engine debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a bundled demo workflow.
    Demo {
        /// Which demo to run.
        #[arg(value_enum)]
        which: DemoKind,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoKind {
    /// Order saga: a failing shipment unwinds payment and inventory.
    Saga,
    /// Parallel checks plus a detached audit branch.
    Fork,
    /// Per-item nested workflow computing an order subtotal.
    Loop,
    /// Flaky gateway recovered by exponential backoff.
    Retry,
}
