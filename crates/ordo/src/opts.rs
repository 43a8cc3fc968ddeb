use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
pub(crate) struct Opts {
    /// Consensus config (JSON); missing fields take their defaults
    #[arg(long, env = "ORDO_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Print the effective consensus config
    Config,
    /// Run an in-process cluster and print the final replica states
    Simulate(SimulateOpts),
}

#[derive(Debug, Args, Clone)]
pub(crate) struct SimulateOpts {
    #[arg(long, env = "ORDO_REPLICAS", default_value = "4")]
    pub replicas: u8,

    /// Client batches to get ordered
    #[arg(long, env = "ORDO_BATCHES", default_value = "20")]
    pub batches: u64,

    /// Stop the initial primary after this many batches
    #[arg(long, env = "ORDO_CRASH_PRIMARY_AFTER")]
    pub crash_primary_after: Option<u64>,

    #[arg(long, env = "ORDO_CHECKPOINT_INTERVAL")]
    pub checkpoint_interval: Option<u64>,

    #[arg(long, env = "ORDO_LOG_SIZE")]
    pub log_size: Option<u64>,

    #[arg(long, env = "ORDO_FRESHNESS_INTERVAL_MS", default_value = "100")]
    pub freshness_interval_ms: u64,

    /// Give up on a batch after this long
    #[arg(long, env = "ORDO_BATCH_TIMEOUT_MS", default_value = "30000")]
    pub batch_timeout_ms: u64,
}
