//! The scenario driver.
//!
//! [`ScenarioDriver`] sequences node lifecycle, links, milestone waits and
//! comparisons. Every step that violates a lifecycle precondition or observes
//! a divergence returns an error, so a scenario reads as a chain of `?`.

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;

use syncprobe_core::{
    BlockHeight, ChecksumAccumulator, KeyPrefix, LtHash, MigrationSchedule, PrefixRegistry,
    StateDigest,
};
use syncprobe_store::PrefixedStore;
use syncprobe_sync::{DiffReport, Milestone, MilestoneSignal, NetworkLink, Node, PeerEndpoint};

use crate::config::ScenarioConfig;
use crate::error::{Result, ScenarioError};

/// Drives nodes through a scenario and checks the result.
#[derive(Debug, Clone)]
pub struct ScenarioDriver {
    config: ScenarioConfig,
    registry: PrefixRegistry,
    schedule: MigrationSchedule,
}

impl ScenarioDriver {
    /// Create a driver for nodes whose keyspace is described by `registry`.
    pub fn new(config: ScenarioConfig, registry: PrefixRegistry) -> Self {
        Self {
            config,
            registry,
            schedule: MigrationSchedule::default(),
        }
    }

    /// Checksum hashing rules used by [`compute_node_state_checksum`](Self::compute_node_state_checksum).
    pub fn with_schedule(mut self, schedule: MigrationSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn registry(&self) -> &PrefixRegistry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Node lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn start_node<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        if node.is_running() {
            return Err(ScenarioError::Precondition(format!(
                "node {} is already running",
                node.endpoint_name()
            )));
        }
        node.start().await?;
        tracing::info!(node = %node.endpoint_name(), "node started");
        Ok(())
    }

    pub async fn shutdown_node<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        if !node.is_running() {
            return Err(ScenarioError::Precondition(format!(
                "node {} is not running",
                node.endpoint_name()
            )));
        }
        node.stop().await?;
        tracing::info!(node = %node.endpoint_name(), "node stopped");
        Ok(())
    }

    /// Stop then start a running node with its original configuration.
    pub async fn restart_node<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        if !node.is_running() {
            return Err(ScenarioError::Precondition(format!(
                "cannot restart node {}: not running",
                node.endpoint_name()
            )));
        }
        node.stop().await?;
        node.start().await?;
        tracing::info!(node = %node.endpoint_name(), "node restarted");
        Ok(())
    }

    /// Connect two nodes with a fresh, started link.
    pub fn bridge<A: Node, B: Node>(&self, a: &Arc<A>, b: &Arc<B>) -> Result<NetworkLink> {
        let a: Arc<dyn PeerEndpoint> = Arc::clone(a) as Arc<dyn PeerEndpoint>;
        let b: Arc<dyn PeerEndpoint> = Arc::clone(b) as Arc<dyn PeerEndpoint>;
        let link = NetworkLink::new(a, b);
        link.start()?;
        Ok(link)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Milestones
    // ─────────────────────────────────────────────────────────────────────────

    pub fn listen_for_block_height<N: Node>(
        &self,
        node: &Arc<N>,
        height: BlockHeight,
    ) -> MilestoneSignal {
        self.config
            .waiter()
            .listen(Arc::clone(node), Milestone::BlockHeight(height))
    }

    pub fn listen_for_sync_prefix<N: Node>(
        &self,
        node: &Arc<N>,
        prefix: KeyPrefix,
    ) -> MilestoneSignal {
        self.config
            .waiter()
            .listen(Arc::clone(node), Milestone::SyncPrefix(prefix))
    }

    pub async fn wait_for_node_to_fully_sync<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        self.wait_for(node, Milestone::FullySynced).await
    }

    pub async fn wait_for_node_to_fully_sync_and_store_all_blocks<N: Node>(
        &self,
        node: &Arc<N>,
    ) -> Result<()> {
        self.wait_for(node, Milestone::FullyStored).await
    }

    pub async fn wait_for_node_to_fully_sync_tx_index<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        self.wait_for(node, Milestone::TxIndexSynced).await
    }

    async fn wait_for<N: Node>(&self, node: &Arc<N>, milestone: Milestone) -> Result<()> {
        tracing::debug!(node = %node.endpoint_name(), milestone = %milestone, "waiting");
        self.config.waiter().wait(Arc::clone(node), milestone).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fault injection
    // ─────────────────────────────────────────────────────────────────────────

    /// Sever `link` once `node` reaches `height`.
    pub async fn disconnect_at_block_height<N: Node>(
        &self,
        node: &Arc<N>,
        link: &NetworkLink,
        height: BlockHeight,
    ) -> Result<()> {
        self.listen_for_block_height(node, height).wait().await?;
        link.disconnect()?;
        tracing::info!(
            node = %node.endpoint_name(),
            target = height,
            reached = node.sync_status().height,
            "disconnected at block height"
        );
        Ok(())
    }

    /// Sever `link` at `height`, restart `node`, and return a new link to `peer`.
    pub async fn restart_at_height_and_reconnect_node<N: Node, P: Node>(
        &self,
        node: &Arc<N>,
        peer: &Arc<P>,
        link: &NetworkLink,
        height: BlockHeight,
    ) -> Result<NetworkLink> {
        self.disconnect_at_block_height(node, link, height).await?;
        self.restart_and_reconnect(node, peer).await
    }

    /// Sever `link` once `node` begins hypersyncing `prefix`.
    pub async fn disconnect_at_sync_prefix<N: Node>(
        &self,
        node: &Arc<N>,
        link: &NetworkLink,
        prefix: KeyPrefix,
    ) -> Result<()> {
        self.listen_for_sync_prefix(node, prefix.clone()).wait().await?;
        link.disconnect()?;
        tracing::info!(
            node = %node.endpoint_name(),
            prefix = %prefix,
            "disconnected at sync prefix"
        );
        Ok(())
    }

    /// Sever `link` at `prefix`, restart `node`, and return a new link to `peer`.
    pub async fn restart_at_sync_prefix_and_reconnect_node<N: Node, P: Node>(
        &self,
        node: &Arc<N>,
        peer: &Arc<P>,
        link: &NetworkLink,
        prefix: KeyPrefix,
    ) -> Result<NetworkLink> {
        self.disconnect_at_sync_prefix(node, link, prefix).await?;
        self.restart_and_reconnect(node, peer).await
    }

    async fn restart_and_reconnect<N: Node, P: Node>(
        &self,
        node: &Arc<N>,
        peer: &Arc<P>,
    ) -> Result<NetworkLink> {
        self.restart_node(node).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        self.bridge(node, peer)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Comparison
    // ─────────────────────────────────────────────────────────────────────────

    /// Compare two arbitrary stores under `prefixes`.
    pub async fn compare_stores<A, B>(
        &self,
        a: &A,
        b: &B,
        prefixes: &[KeyPrefix],
    ) -> Result<DiffReport>
    where
        A: PrefixedStore + ?Sized,
        B: PrefixedStore + ?Sized,
    {
        let report = self.config.differ().compare(a, b, prefixes).await?;
        if report.is_match() {
            Ok(report)
        } else {
            Err(ScenarioError::Diverged {
                report: Box::new(report),
            })
        }
    }

    /// Compare primary stores on every prefix whose content does not depend
    /// on how the node synced.
    pub async fn compare_nodes_by_db<A: Node, B: Node>(
        &self,
        a: &Arc<A>,
        b: &Arc<B>,
    ) -> Result<DiffReport> {
        let prefixes = self.registry.comparable_prefixes();
        self.compare_stores(&*a.chain_store(), &*b.chain_store(), &prefixes)
            .await
    }

    /// Compare primary stores on the state-bearing prefixes.
    pub async fn compare_nodes_by_state<A: Node, B: Node>(
        &self,
        a: &Arc<A>,
        b: &Arc<B>,
    ) -> Result<DiffReport> {
        let prefixes = self.registry.state_prefixes();
        self.compare_stores(&*a.chain_store(), &*b.chain_store(), &prefixes)
            .await
    }

    /// Compare transaction index stores.
    pub async fn compare_nodes_by_tx_index<A: Node, B: Node>(
        &self,
        a: &Arc<A>,
        b: &Arc<B>,
    ) -> Result<DiffReport> {
        let index_a = a
            .tx_index_store()
            .ok_or_else(|| ScenarioError::MissingTxIndex(a.endpoint_name()))?;
        let index_b = b
            .tx_index_store()
            .ok_or_else(|| ScenarioError::MissingTxIndex(b.endpoint_name()))?;
        let prefixes = self.registry.comparable_prefixes();
        self.compare_stores(&*index_a, &*index_b, &prefixes).await
    }

    /// Require the nodes' own snapshot checksums to be byte-equal.
    pub async fn compare_nodes_by_checksum<A: Node, B: Node>(
        &self,
        a: &Arc<A>,
        b: &Arc<B>,
    ) -> Result<()> {
        let checksum_a = a
            .snapshot_checksum()
            .await?
            .ok_or_else(|| ScenarioError::MissingChecksum(a.endpoint_name()))?;
        let checksum_b = b
            .snapshot_checksum()
            .await?
            .ok_or_else(|| ScenarioError::MissingChecksum(b.endpoint_name()))?;

        if checksum_a != checksum_b {
            let err = ScenarioError::ChecksumMismatch {
                node_a: a.endpoint_name(),
                digest_a: StateDigest::of(&checksum_a).to_hex(),
                node_b: b.endpoint_name(),
                digest_b: StateDigest::of(&checksum_b).to_hex(),
            };
            tracing::error!("{}", err);
            return Err(err);
        }
        tracing::info!(
            digest = %StateDigest::of(&checksum_a),
            "snapshot checksums match"
        );
        Ok(())
    }

    /// Recompute a state checksum from the node's state-bearing prefixes.
    ///
    /// Every record is hashed with the rule in effect at `height`.
    pub async fn compute_node_state_checksum<N: Node>(
        &self,
        node: &Arc<N>,
        height: BlockHeight,
    ) -> Result<Vec<u8>> {
        let checksum = ChecksumAccumulator::<LtHash>::new(self.schedule.clone());
        checksum.initialize()?;

        let store = node.chain_store();
        let mut records = 0usize;
        for prefix in self.registry.state_prefixes() {
            let mut cursor: Option<Bytes> = None;
            loop {
                let chunk = store
                    .iterate_prefix(&prefix, cursor.as_deref(), self.config.diff_page_size)
                    .await
                    .map_err(|source| ScenarioError::StoreRead {
                        node: node.endpoint_name(),
                        prefix: prefix.clone(),
                        cursor: cursor
                            .as_ref()
                            .map_or_else(|| "<start>".to_string(), hex::encode),
                        source,
                    })?;
                for entry in &chunk.entries {
                    checksum.add_or_remove(&entry.key, &entry.value, height, true)?;
                }
                records += chunk.len();
                match chunk.last_key() {
                    Some(last) if chunk.is_full => cursor = Some(last.clone()),
                    _ => break,
                }
            }
        }

        checksum.wait().await?;
        let bytes = checksum.to_bytes()?;
        tracing::debug!(
            node = %node.endpoint_name(),
            height,
            records,
            digest = %StateDigest::of(&bytes),
            "recomputed state checksum"
        );
        Ok(bytes)
    }

    /// Require a node's incremental checksum to match a full recomputation
    /// at its current height.
    pub async fn verify_node_checksum<N: Node>(&self, node: &Arc<N>) -> Result<()> {
        let height = node.sync_status().height;
        let expected = self.compute_node_state_checksum(node, height).await?;
        let actual = node
            .snapshot_checksum()
            .await?
            .ok_or_else(|| ScenarioError::MissingChecksum(node.endpoint_name()))?;
        if expected != actual {
            return Err(ScenarioError::ChecksumMismatch {
                node_a: format!("{} (recomputed)", node.endpoint_name()),
                digest_a: StateDigest::of(&expected).to_hex(),
                node_b: node.endpoint_name(),
                digest_b: StateDigest::of(&actual).to_hex(),
            });
        }
        Ok(())
    }

    /// DB comparison followed by checksum comparison.
    pub async fn assert_converged<A: Node, B: Node>(&self, a: &Arc<A>, b: &Arc<B>) -> Result<()> {
        self.compare_nodes_by_db(a, b).await?;
        self.compare_nodes_by_checksum(a, b).await?;
        tracing::info!(a = %a.endpoint_name(), b = %b.endpoint_name(), "nodes converged");
        Ok(())
    }
}

/// Uniform random height in `[min, max)`.
pub fn random_height_between(min: BlockHeight, max: BlockHeight) -> Result<BlockHeight> {
    if min >= max {
        return Err(ScenarioError::InvalidRange { min, max });
    }
    Ok(rand::thread_rng().gen_range(min..max))
}
