//! Scenario configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use syncprobe_core::{BlockHeight, SNAPSHOT_BATCH_SIZE};
use syncprobe_sync::{
    MilestoneWaiter, ResidualPolicy, StateDiffer, HEIGHT_POLL_INTERVAL, SYNC_POLL_INTERVAL,
};

/// Default height the source chain is built to.
pub const DEFAULT_MAX_SYNC_HEIGHT: BlockHeight = 1500;

/// Default number of blocks between snapshots.
pub const DEFAULT_SNAPSHOT_PERIOD: BlockHeight = 1000;

/// Default pause after restarting a node before reconnecting it.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Knobs shared by every step of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub max_sync_height: BlockHeight,
    pub snapshot_period: BlockHeight,
    pub height_poll_interval: Duration,
    pub sync_poll_interval: Duration,
    pub settle_delay: Duration,
    /// Page budget for store comparison.
    pub diff_page_size: usize,
    pub verbose: u8,
    pub residual_policy: ResidualPolicy,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            max_sync_height: DEFAULT_MAX_SYNC_HEIGHT,
            snapshot_period: DEFAULT_SNAPSHOT_PERIOD,
            height_poll_interval: HEIGHT_POLL_INTERVAL,
            sync_poll_interval: SYNC_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            diff_page_size: SNAPSHOT_BATCH_SIZE,
            verbose: 0,
            residual_policy: ResidualPolicy::Diagnostic,
        }
    }
}

impl ScenarioConfig {
    pub fn with_max_sync_height(mut self, height: BlockHeight) -> Self {
        self.max_sync_height = height;
        self
    }

    pub fn with_snapshot_period(mut self, period: BlockHeight) -> Self {
        self.snapshot_period = period;
        self
    }

    pub fn with_poll_intervals(mut self, height: Duration, sync: Duration) -> Self {
        self.height_poll_interval = height;
        self.sync_poll_interval = sync;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_diff_page_size(mut self, bytes: usize) -> Self {
        self.diff_page_size = bytes;
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_residual_policy(mut self, policy: ResidualPolicy) -> Self {
        self.residual_policy = policy;
        self
    }

    /// A differ configured from these settings.
    pub fn differ(&self) -> StateDiffer {
        StateDiffer::new(self.diff_page_size)
            .with_verbose(self.verbose)
            .with_residual_policy(self.residual_policy)
    }

    /// A milestone waiter configured from these settings.
    pub fn waiter(&self) -> MilestoneWaiter {
        MilestoneWaiter::new()
            .with_height_poll(self.height_poll_interval)
            .with_sync_poll(self.sync_poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScenarioConfig::default();
        assert_eq!(config.max_sync_height, 1500);
        assert_eq!(config.snapshot_period, 1000);
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.differ().max_bytes(), SNAPSHOT_BATCH_SIZE);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ScenarioConfig =
            serde_json::from_str(r#"{"max_sync_height": 300, "residual_policy": "fatal"}"#)
                .unwrap();
        assert_eq!(config.max_sync_height, 300);
        assert_eq!(config.residual_policy, ResidualPolicy::Fatal);
        assert_eq!(config.snapshot_period, DEFAULT_SNAPSHOT_PERIOD);
    }
}
