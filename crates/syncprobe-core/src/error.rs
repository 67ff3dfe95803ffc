//! Error types for Syncprobe Core.

use thiserror::Error;

use crate::types::KeyPrefix;

/// Errors raised while building prefix registries and other core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("key prefix must not be empty")]
    EmptyPrefix,

    #[error("prefix {0} is already registered")]
    DuplicatePrefix(KeyPrefix),

    #[error("prefix {new} overlaps registered prefix {existing}")]
    OverlappingPrefix { existing: KeyPrefix, new: KeyPrefix },

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors surfaced by the checksum accumulator.
///
/// None of these are retried: a checksum that cannot be trusted must fail the
/// step that asked for it.
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum used before initialize()")]
    NotInitialized,

    #[error("{0} checksum operations still pending")]
    PendingOperations(usize),

    #[error("a queued checksum operation failed; re-initialize before reuse")]
    OperationFailed,

    #[error("checksum task failed: {0}")]
    TaskFailed(String),

    #[error("checksum operations require a running tokio runtime")]
    NoRuntime,

    #[error("checksum state lock poisoned")]
    Poisoned,
}
