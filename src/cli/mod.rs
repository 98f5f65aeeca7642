//! CLI command handling.
//!
//! Provides subcommands for:
//! - Listing configured services (`services`)
//! - One-shot or per-service status (`status`)
//! - Reading container logs (`logs`)
//! - Running a command inside a service container (`exec`)
//! - Streaming setup milestones (`setup-status`)
//! - Tracking events and printing status periodically (`watch`)

mod logs;
mod setup;
mod status;

pub use logs::{run_exec_command, run_logs_command};
pub use setup::run_setup_status_command;
pub use status::{render_table, run_services_command, run_status_command, run_watch_command};

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dockwatch")]
#[command(about = "Readiness status for a fleet of containerized backends")]
#[command(
    long_about = "Dockwatch derives a status for every configured backend from its container and its control API.\nExamples:\n  dockwatch status  # Status of every service\n  dockwatch logs lndbtc --since 10m"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Service list (defaults to $DOCKWATCH_CONFIG, then ./dockwatch.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List configured services in dependency order
    Services {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the status of every service, or of one
    #[command(long_about = "Query every service concurrently.\nExample: dockwatch status bitcoind")]
    Status {
        /// Only this service
        service: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a service container's logs
    Logs {
        service: String,

        /// Relative (10m, 1h, 2d), RFC 3339, or unix seconds
        #[arg(long, default_value = "1h")]
        since: String,

        /// "all" or a line count
        #[arg(long, default_value = "all")]
        tail: String,

        /// Keep following until interrupted
        #[arg(short, long)]
        follow: bool,
    },

    /// Run a command in a service container
    Exec {
        service: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Stream setup milestones as JSON lines until setup is done
    SetupStatus {
        /// Replay this many past milestones first (-1 for all)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        history: i64,
    },

    /// Track container events and print status periodically
    Watch {
        /// Seconds between status prints
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}
