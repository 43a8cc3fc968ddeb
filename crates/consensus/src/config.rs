use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ConfigError {
    ZeroCheckpointInterval,
    #[snafu(display("Log size {log_size} is not a positive multiple of checkpoint interval {checkpoint_interval}"))]
    InvalidLogSize {
        log_size: u64,
        checkpoint_interval: u64,
    },
    ZeroStashLimit,
    ZeroStallTicks,
    #[snafu(display("{name} must not be zero"))]
    ZeroTimeout { name: &'static str },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables of a consensus instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Checkpoint every this many ordered batches
    #[builder(default = 100)]
    pub checkpoint_interval: u64,
    /// Width of the watermark window above the stable checkpoint
    #[builder(default = 300)]
    pub log_size: u64,
    /// Stashed messages a single peer may have pending
    #[builder(default = 1024)]
    pub max_stash_per_sender: usize,
    #[builder(default = 5_000)]
    pub freshness_interval_ms: u64,
    /// Idle freshness ticks after which a backup suspects the primary
    #[builder(default = 2)]
    pub freshness_stall_ticks: u32,
    #[builder(default = 10_000)]
    pub ordering_timeout_ms: u64,
    #[builder(default = 5_000)]
    pub gap_timeout_ms: u64,
    /// Base timeout of a view change, doubled with every escalation
    #[builder(default = 15_000)]
    pub view_change_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ensure!(self.checkpoint_interval != 0, ZeroCheckpointIntervalSnafu);
        ensure!(
            self.log_size != 0 && self.log_size % self.checkpoint_interval == 0,
            InvalidLogSizeSnafu {
                log_size: self.log_size,
                checkpoint_interval: self.checkpoint_interval,
            }
        );
        ensure!(self.max_stash_per_sender != 0, ZeroStashLimitSnafu);
        ensure!(self.freshness_stall_ticks != 0, ZeroStallTicksSnafu);
        for (name, ms) in [
            ("freshness_interval_ms", self.freshness_interval_ms),
            ("ordering_timeout_ms", self.ordering_timeout_ms),
            ("gap_timeout_ms", self.gap_timeout_ms),
            ("view_change_timeout_ms", self.view_change_timeout_ms),
        ] {
            ensure!(ms != 0, ZeroTimeoutSnafu { name });
        }
        Ok(())
    }

    pub fn freshness_interval(&self) -> Duration {
        Duration::from_millis(self.freshness_interval_ms)
    }

    pub fn ordering_timeout(&self) -> Duration {
        Duration::from_millis(self.ordering_timeout_ms)
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Timeout of the `attempt`-th consecutive view change (starting at 1)
    pub fn view_change_timeout(&self, attempt: u64) -> Duration {
        let shift = u32::try_from(attempt.saturating_sub(1).min(16)).expect("Can't fail");
        Duration::from_millis(self.view_change_timeout_ms.saturating_mul(1u64 << shift))
    }
}

#[test]
fn config_defaults_are_valid() {
    let config = ConsensusConfig::default();
    assert_eq!(config.validate(), Ok(()));
    assert_eq!(config.checkpoint_interval, 100);
    assert_eq!(config.log_size, 300);
}

#[test]
fn config_validation() {
    assert_eq!(
        ConsensusConfig::builder().log_size(250).build().validate(),
        Err(ConfigError::InvalidLogSize {
            log_size: 250,
            checkpoint_interval: 100
        })
    );
    assert_eq!(
        ConsensusConfig::builder()
            .checkpoint_interval(0)
            .build()
            .validate(),
        Err(ConfigError::ZeroCheckpointInterval)
    );
    assert_eq!(
        ConsensusConfig::builder()
            .freshness_interval_ms(0)
            .build()
            .validate(),
        Err(ConfigError::ZeroTimeout {
            name: "freshness_interval_ms"
        })
    );
    assert_eq!(
        ConsensusConfig::builder()
            .view_change_timeout_ms(0)
            .build()
            .validate(),
        Err(ConfigError::ZeroTimeout {
            name: "view_change_timeout_ms"
        })
    );
}

#[test]
fn view_change_timeout_backs_off() {
    let config = ConsensusConfig::builder().view_change_timeout_ms(100).build();
    assert_eq!(config.view_change_timeout(1), Duration::from_millis(100));
    assert_eq!(config.view_change_timeout(2), Duration::from_millis(200));
    assert_eq!(config.view_change_timeout(4), Duration::from_millis(800));
}

#[test]
fn config_deserializes_with_defaults() {
    let config: ConsensusConfig =
        serde_json::from_str(r#"{"checkpoint_interval": 10, "log_size": 30}"#).expect("valid");
    assert_eq!(config.checkpoint_interval, 10);
    assert_eq!(config.max_stash_per_sender, 1024);
}
