// SPDX-License-Identifier: MIT

mod logging;
mod opts;
pub mod simulate;

use std::path::Path;

use clap::Parser as _;
use opts::{Commands, Opts, SimulateOpts};
use ordo_consensus::ConsensusConfig;
use ordo_util_error::WhateverResult;
use snafu::ResultExt as _;
use tracing::info;

pub(crate) const LOG_TARGET: &str = "ordo";

pub struct Ordo;

#[bon::bon]
impl Ordo {
    #[builder(finish_fn = run, start_fn = builder)]
    pub async fn build(config: Option<ConsensusConfig>) -> WhateverResult<()> {
        logging::init_logging()?;

        let opts = Opts::parse();

        let config = match (config, opts.config) {
            (Some(config), _) => config,
            (None, Some(path)) => load_config(&path).await?,
            (None, None) => ConsensusConfig::default(),
        };

        match opts.command {
            Commands::Config => {
                config
                    .validate()
                    .whatever_context("Invalid consensus config")?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config)
                        .whatever_context("Failed to serialize config")?
                );
            }
            Commands::Simulate(sim_opts) => {
                let config = apply_overrides(config, &sim_opts);
                info!(target: LOG_TARGET, replicas = sim_opts.replicas, batches = sim_opts.batches, "Starting simulation");
                let report = simulate::Simulation::builder()
                    .config(config)
                    .replicas(sim_opts.replicas)
                    .batches(sim_opts.batches)
                    .maybe_crash_primary_after(sim_opts.crash_primary_after)
                    .batch_timeout(std::time::Duration::from_millis(sim_opts.batch_timeout_ms))
                    .build()
                    .run()
                    .await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .whatever_context("Failed to serialize report")?
                );
            }
        }

        Ok(())
    }
}

async fn load_config(path: &Path) -> WhateverResult<ConsensusConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .whatever_context("Failed to read config file")?;
    serde_json::from_str(&content).whatever_context("Failed to parse config file")
}

fn apply_overrides(mut config: ConsensusConfig, opts: &SimulateOpts) -> ConsensusConfig {
    if let Some(checkpoint_interval) = opts.checkpoint_interval {
        config.checkpoint_interval = checkpoint_interval;
    }
    if let Some(log_size) = opts.log_size {
        config.log_size = log_size;
    }
    config.freshness_interval_ms = opts.freshness_interval_ms;
    config
}
