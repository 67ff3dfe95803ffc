//! Error types for the sync module.

use std::fmt;

use thiserror::Error;

use syncprobe_core::{ChecksumError, KeyPrefix};
use syncprobe_store::StoreError;

/// Which of the two compared stores an error or divergence refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreSide {
    A,
    B,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSide::A => write!(f, "A"),
            StoreSide::B => write!(f, "B"),
        }
    }
}

/// Errors that can occur while linking, observing or comparing nodes.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A paginated read failed; comparison cannot continue.
    #[error("problem reading store {side} for prefix {prefix} after cursor {cursor}: {source}")]
    StoreRead {
        side: StoreSide,
        prefix: KeyPrefix,
        cursor: String,
        #[source]
        source: StoreError,
    },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The compared stores differ on at least one prefix.
    #[error("databases differ, broken prefixes: {prefixes:?}")]
    StatesDiverged { prefixes: Vec<KeyPrefix> },

    /// A link endpoint is not running.
    #[error("endpoint {0} is not reachable")]
    EndpointUnreachable(String),

    /// `start` called on a link that is already forwarding.
    #[error("link {0} already started")]
    LinkAlreadyStarted(String),

    /// The link was disconnected and cannot be used again.
    #[error("link {0} already disconnected")]
    LinkSevered(String),

    /// No Tokio runtime to spawn onto.
    #[error("no tokio runtime: {0}")]
    Runtime(String),

    /// A milestone watcher exited without signalling.
    #[error("watcher for {0} stopped before signalling")]
    WatcherClosed(String),

    /// A node rejected or failed an operation.
    #[error("node {node}: {message}")]
    Node { node: String, message: String },

    /// Checksum computation failed.
    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),
}

impl SyncError {
    /// Shorthand for [`SyncError::Node`].
    pub fn node(node: impl Into<String>, message: impl fmt::Display) -> Self {
        SyncError::Node {
            node: node.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
