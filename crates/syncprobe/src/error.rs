//! Error types for scenario runs.

use syncprobe_core::{BlockHeight, ChecksumError, KeyPrefix};
use syncprobe_store::StoreError;
use syncprobe_sync::{DiffReport, SyncError};
use thiserror::Error;

/// Errors that abort a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Link, waiter, node or differ error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A paginated read of a node's store failed.
    #[error("problem reading store of {node} for prefix {prefix} after cursor {cursor}: {source}")]
    StoreRead {
        node: String,
        prefix: KeyPrefix,
        cursor: String,
        #[source]
        source: StoreError,
    },

    /// Checksum computation error.
    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    /// An operation was called in the wrong lifecycle state.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The compared stores differ.
    #[error("databases differ, broken prefixes: {:?}", .report.failing_prefixes())]
    Diverged { report: Box<DiffReport> },

    /// The nodes' own snapshot checksums differ.
    #[error("checksum mismatch: {node_a} has {digest_a}, {node_b} has {digest_b}")]
    ChecksumMismatch {
        node_a: String,
        digest_a: String,
        node_b: String,
        digest_b: String,
    },

    /// A node keeps no snapshot checksum to compare.
    #[error("node {0} has no snapshot checksum")]
    MissingChecksum(String),

    /// A node has no transaction index store.
    #[error("node {0} has no transaction index")]
    MissingTxIndex(String),

    /// Empty or inverted height range.
    #[error("invalid height range [{min}, {max})")]
    InvalidRange { min: BlockHeight, max: BlockHeight },
}

impl ScenarioError {
    /// The comparison report, when this is a divergence.
    pub fn report(&self) -> Option<&DiffReport> {
        match self {
            ScenarioError::Diverged { report } => Some(report),
            _ => None,
        }
    }
}

/// Result type for scenario operations.
pub type Result<T> = std::result::Result<T, ScenarioError>;
