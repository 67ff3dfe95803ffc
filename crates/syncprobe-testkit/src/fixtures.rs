//! Test fixtures and helpers.
//!
//! A [`TestNetwork`] owns a temporary directory, hands out node configs with
//! unique ports and data directories under it, and builds a
//! [`ScenarioDriver`] wired to the simulated chain's prefix registry and
//! checksum schedule.

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::Level;

use syncprobe::{ScenarioConfig, ScenarioDriver};
use syncprobe_core::BlockHeight;

use crate::chain;
use crate::config::{SimNodeConfig, SyncMode};
use crate::node::SimNode;

/// Environment variable selecting the test log level.
pub const LOG_ENV: &str = "SYNCPROBE_LOG";

/// Install a test-friendly subscriber once per process.
///
/// Defaults to `WARN`; set `SYNCPROBE_LOG=debug` (or any level) for more.
pub fn init_tracing() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::WARN);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

/// A set of simulated nodes sharing one temporary directory.
pub struct TestNetwork {
    dir: TempDir,
    driver: ScenarioDriver,
    next_port: AtomicU16,
}

impl TestNetwork {
    /// Network producing `max_sync_height` blocks, snapshotting every
    /// `snapshot_period`.
    pub fn new(max_sync_height: BlockHeight, snapshot_period: BlockHeight) -> anyhow::Result<Self> {
        let config = ScenarioConfig::default()
            .with_max_sync_height(max_sync_height)
            .with_snapshot_period(snapshot_period)
            .with_settle_delay(Duration::from_millis(20));
        Self::with_config(config)
    }

    pub fn with_config(config: ScenarioConfig) -> anyhow::Result<Self> {
        init_tracing();
        let driver =
            ScenarioDriver::new(config, chain::registry()?).with_schedule(chain::schedule());
        Ok(Self {
            dir: tempfile::tempdir()?,
            driver,
            next_port: AtomicU16::new(18000),
        })
    }

    pub fn driver(&self) -> &ScenarioDriver {
        &self.driver
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Config for a new node named `name`, matching the network's heights.
    pub fn node_config(&self, name: &str) -> SimNodeConfig {
        let scenario = self.driver.config();
        SimNodeConfig::new(name, self.dir.path().join(name))
            .with_port(self.next_port.fetch_add(1, Ordering::SeqCst))
            .with_max_sync_height(scenario.max_sync_height)
            .with_snapshot_period(scenario.snapshot_period)
    }

    pub fn spawn(&self, config: SimNodeConfig) -> anyhow::Result<Arc<SimNode>> {
        Ok(Arc::new(SimNode::open(config)?))
    }

    /// A block producer holding the full chain once started.
    pub fn producer(&self, name: &str) -> anyhow::Result<Arc<SimNode>> {
        self.spawn(self.node_config(name).with_block_producer(true))
    }

    pub fn block_sync_node(&self, name: &str) -> anyhow::Result<Arc<SimNode>> {
        self.spawn(self.node_config(name))
    }

    pub fn hypersync_node(&self, name: &str) -> anyhow::Result<Arc<SimNode>> {
        self.spawn(self.node_config(name).with_sync_mode(SyncMode::HyperSync))
    }

    /// Started producer plus an unstarted syncing node built from `config`.
    pub async fn source_and(
        &self,
        config: SimNodeConfig,
    ) -> anyhow::Result<(Arc<SimNode>, Arc<SimNode>)> {
        let source = self.producer("source")?;
        self.driver.start_node(&source).await?;
        let node = self.spawn(config)?;
        Ok((source, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_configs_are_distinct() {
        let net = TestNetwork::new(30, 10).unwrap();
        let a = net.node_config("a");
        let b = net.node_config("b");
        assert_ne!(a.port, b.port);
        assert_ne!(a.data_dir, b.data_dir);
        assert_eq!(a.max_sync_height, 30);
        assert_eq!(b.snapshot_period, 10);
    }
}
