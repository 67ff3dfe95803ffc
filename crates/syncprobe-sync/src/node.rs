//! The boundary with the node under test.
//!
//! Nodes are opaque: the verifier never reaches into their internals. It only
//! starts and stops them, reads the accessors below, and hands them peer
//! connections through [`PeerEndpoint`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use syncprobe_core::{BlockHeight, KeyPrefix};
use syncprobe_store::PrefixedStore;

use crate::error::Result;

/// One end of an in-process byte stream handed to a node's peer layer.
pub type PeerConnection = tokio::io::DuplexStream;

/// Which side opened a connection, from the receiving node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// The part of a node a [`NetworkLink`](crate::bridge::NetworkLink) needs.
///
/// Object safe so links can join heterogeneous nodes.
pub trait PeerEndpoint: Send + Sync {
    /// Name used in logs and errors.
    fn endpoint_name(&self) -> String;

    /// Whether the endpoint can accept a connection right now.
    fn is_reachable(&self) -> bool;

    /// Hand a connection to the node's own networking layer.
    ///
    /// The node owns the stream from here on; a closed stream is how it
    /// observes a disconnect.
    fn attach_peer(
        &self,
        conn: PeerConnection,
        direction: LinkDirection,
        peer_name: &str,
    ) -> Result<()>;
}

/// Observable synchronization state of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Height of the highest block applied.
    pub height: BlockHeight,
    /// The node considers itself caught up with the network.
    pub fully_current: bool,
    /// Caught up, and every block up to the tip has been persisted.
    pub fully_stored: bool,
    /// The transaction index has caught up with the chain.
    pub tx_index_synced: bool,
}

/// Hypersync download progress for one state prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixProgress {
    pub prefix: KeyPrefix,
    /// Last key received for this prefix; `None` before the first chunk.
    pub last_received_key: Option<Bytes>,
    pub completed: bool,
}

/// A ledger node under test.
///
/// # Contract
///
/// - `start` on a running node and `stop` on a stopped node are errors.
/// - `start` after `stop` reuses the node's original configuration and its
///   persisted stores.
/// - Accessors are cheap and may be polled at millisecond intervals.
#[async_trait]
pub trait Node: PeerEndpoint + 'static {
    /// Store type behind the primary and secondary handles.
    type Store: PrefixedStore + 'static;

    fn is_running(&self) -> bool;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Current synchronization state.
    fn sync_status(&self) -> SyncStatus;

    /// Wait until background snapshot/checksum work has drained.
    ///
    /// Nodes without background work return immediately.
    async fn wait_for_background_idle(&self) -> Result<()>;

    /// The node's own incrementally-maintained state checksum, if it keeps one.
    async fn snapshot_checksum(&self) -> Result<Option<Vec<u8>>>;

    /// The primary (chain state) store.
    fn chain_store(&self) -> Arc<Self::Store>;

    /// The secondary transaction-index store, when enabled.
    fn tx_index_store(&self) -> Option<Arc<Self::Store>>;

    /// Per-prefix hypersync progress records.
    fn hypersync_progress(&self) -> Vec<PrefixProgress>;
}
