use std::path::PathBuf;

use clap::{Parser, Subcommand};
use signalbus_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "signalbus",
    version,
    about = "Perform signal bus operations",
    long_about = "Send pending outbox signals over the message bus and inspect the outbox tables"
)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// TOML manifest describing the signal tables
    #[arg(long, env = "SIGNALBUS_MANIFEST", default_value = "signalbus.toml")]
    pub manifest: PathBuf,

    /// Redis server to publish signals to
    #[arg(long, env = "SIGNALBUS_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Maximum number of pooled database connections
    #[arg(long, default_value_t = 4)]
    pub max_connections: u32,

    /// Log output format [json, pretty]
    #[arg(long, env = "SIGNALBUS_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send pending signals over the message bus.
    ///
    /// If SIGNAL_NAMES are given, flushes only those signals; otherwise
    /// flushes all signals.
    Flush {
        /// Do not flush signals with the specified name
        #[arg(short, long, value_name = "NAME")]
        exclude: Vec<String>,

        /// Seconds to wait after listing pending signals, so concurrent
        /// senders can complete
        #[arg(short, long, allow_negative_numbers = true)]
        wait: Option<f64>,

        signal_names: Vec<String>,
    },

    /// Send a potentially huge number of pending signals.
    ///
    /// Pages are claimed with SKIP LOCKED, so several processes may run this
    /// at once. Mostly useful after long periods of disconnection from the
    /// message bus.
    Flushmany { signal_names: Vec<String> },

    /// Send pending signals in the order their tables declare.
    ///
    /// Run only one ordered sender at a time.
    Flushordered { signal_names: Vec<String> },

    /// Show all signal types.
    Signals,

    /// Show the number of pending signals by signal type.
    Pending,
}
