use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mojo-host",
    about = "Operator front door for the mojo task queue",
    long_about = None
)]
pub struct Cli {
    #[arg(
        long,
        require_equals = true,
        env = "MOJO_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    /// URL of the shared store
    pub redis_url: String,

    #[arg(long, require_equals = true, default_value = "mojo:tasks")]
    /// Key prefix shared by every process on this queue
    pub prefix: String,

    #[arg(long)]
    /// Use the in-process memory backend instead of Redis. Only useful for
    /// kicking the tires: nothing is shared and nothing survives exit.
    pub memory_store: bool,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    /// Set the log level
    pub log_level: String,

    #[arg(long, require_equals = true)]
    /// Also write JSON logs into this directory
    pub log_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a task engine until interrupted. Exits 0 only when the final
    /// drain completes in time.
    Run {
        #[arg(long, require_equals = true, value_delimiter = ',', default_value = "default")]
        /// Channels to consume, comma separated
        channels: Vec<String>,

        #[arg(long, require_equals = true, default_value_t = 5)]
        /// Size of the worker pool
        max_workers: usize,

        #[arg(long, require_equals = true, default_value_t = 30)]
        /// Seconds to wait for in-flight tasks on shutdown
        drain_timeout: u64,
    },

    /// Print the fleet-wide queue aggregate as JSON
    Status {
        #[arg(long)]
        /// Omit the per-channel breakdown
        simple: bool,

        #[arg(long)]
        /// Only scan the default channel list instead of every known channel
        local: bool,
    },

    /// Print one channel's queue counts as JSON
    ChannelStatus { channel: String },

    /// Enqueue a task by dotted function name
    Publish {
        function: String,

        #[arg(long, require_equals = true, default_value = "default")]
        channel: String,

        #[arg(long, require_equals = true)]
        /// JSON payload, conventionally {"args": [...], "kwargs": {...}}
        data: Option<String>,

        #[arg(long, require_equals = true)]
        /// Seconds until runners refuse to start the task
        expires: Option<u64>,
    },

    /// Cancel a pending task by id. Exits 1 when the task was already
    /// running or settled.
    Cancel { task_id: String },

    /// Drop all four queue lists of a channel
    ClearChannel { channel: String },

    /// Purge runner registry entries older than the given ping age
    ClearRunners {
        #[arg(long, require_equals = true, default_value_t = 120)]
        ping_age: u64,
    },
}

pub fn parse_opts() -> Cli {
    Cli::parse()
}
