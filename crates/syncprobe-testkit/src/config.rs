//! Simulated node configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use syncprobe::{DEFAULT_MAX_SYNC_HEIGHT, DEFAULT_SNAPSHOT_PERIOD};
use syncprobe_core::{BlockHeight, SNAPSHOT_BATCH_SIZE};

/// File name of the persisted config inside the data directory.
pub const CONFIG_FILE: &str = "node.json";

/// How a node catches up with its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Download and execute every block.
    BlockSync,
    /// Download the latest snapshot, then block sync the rest.
    HyperSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimNodeConfig {
    pub name: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_peers: usize,
    pub sync_mode: SyncMode,
    /// Produce the chain up to `max_sync_height` on start instead of syncing.
    pub block_producer: bool,
    /// After hypersync, also fetch the block bodies below the snapshot.
    pub archival: bool,
    pub tx_index: bool,
    pub snapshot_period: BlockHeight,
    pub max_sync_height: BlockHeight,
    /// Page budget when serving snapshot chunks.
    pub snapshot_chunk_bytes: usize,
    /// Blocks per `GetBlocks` request.
    pub block_batch: BlockHeight,
    pub chain_seed: u64,
}

impl SimNodeConfig {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            port: 18000,
            data_dir: data_dir.into(),
            max_peers: 8,
            sync_mode: SyncMode::BlockSync,
            block_producer: false,
            archival: false,
            tx_index: false,
            snapshot_period: DEFAULT_SNAPSHOT_PERIOD,
            max_sync_height: DEFAULT_MAX_SYNC_HEIGHT,
            snapshot_chunk_bytes: SNAPSHOT_BATCH_SIZE,
            block_batch: 50,
            chain_seed: 0x5eed,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_block_producer(mut self, producer: bool) -> Self {
        self.block_producer = producer;
        self
    }

    pub fn with_archival(mut self, archival: bool) -> Self {
        self.archival = archival;
        self
    }

    pub fn with_tx_index(mut self, enabled: bool) -> Self {
        self.tx_index = enabled;
        self
    }

    pub fn with_snapshot_period(mut self, period: BlockHeight) -> Self {
        self.snapshot_period = period;
        self
    }

    pub fn with_max_sync_height(mut self, height: BlockHeight) -> Self {
        self.max_sync_height = height;
        self
    }

    pub fn with_snapshot_chunk_bytes(mut self, bytes: usize) -> Self {
        self.snapshot_chunk_bytes = bytes.max(1);
        self
    }

    pub fn with_block_batch(mut self, batch: BlockHeight) -> Self {
        self.block_batch = batch.max(1);
        self
    }

    pub fn with_chain_seed(mut self, seed: u64) -> Self {
        self.chain_seed = seed;
        self
    }

    /// `name@port`, used as the peer endpoint name.
    pub fn endpoint(&self) -> String {
        format!("{}@{}", self.name, self.port)
    }

    /// Write the config as JSON into the data directory.
    pub fn save(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("create data dir {}", self.data_dir.display()))?;
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(self.data_dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Load a config previously written by [`save`](Self::save).
    pub fn load(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE);
        let json = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimNodeConfig::new("fresh", dir.path())
            .with_sync_mode(SyncMode::HyperSync)
            .with_tx_index(true)
            .with_port(18004);
        config.save().unwrap();

        let loaded = SimNodeConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.endpoint(), "fresh@18004");
    }
}
