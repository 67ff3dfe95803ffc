//! # Syncprobe Sync
//!
//! The pieces a scenario needs to connect nodes, watch them sync, and decide
//! whether they ended up in the same state.
//!
//! ## Overview
//!
//! - [`Node`] / [`PeerEndpoint`] - the opaque boundary with a node under test
//! - [`NetworkLink`] - an in-process, severable connection between two nodes
//! - [`MilestoneWaiter`] - polling watchers for heights and sync completion
//! - [`StateDiffer`] - paged, prefix-by-prefix comparison of two stores
//!
//! ## Usage
//!
//! ```rust,no_run
//! use syncprobe_core::KeyPrefix;
//! use syncprobe_store::MemoryKvStore;
//! use syncprobe_sync::StateDiffer;
//!
//! async fn example() {
//!     let a = MemoryKvStore::new();
//!     let b = MemoryKvStore::new();
//!     let report = StateDiffer::default()
//!         .compare(&a, &b, &[KeyPrefix::from_byte(0x01)])
//!         .await
//!         .unwrap();
//!     println!("match: {}", report.is_match());
//! }
//! ```
//!
//! ## Link Lifecycle
//!
//! ```text
//! Idle --start--> Running --disconnect--> Severed
//!   \______________disconnect______________/
//! ```

pub mod bridge;
pub mod convergence;
pub mod error;
pub mod node;
pub mod waiter;

pub use bridge::{LinkStats, NetworkLink, DEFAULT_PIPE_CAPACITY};
pub use convergence::{
    DiffReport, Divergence, DivergenceCounts, DivergenceKind, PrefixReport, ResidualPolicy,
    StateDiffer, MAX_RECORDED_DIVERGENCES,
};
pub use error::{Result, StoreSide, SyncError};
pub use node::{LinkDirection, Node, PeerConnection, PeerEndpoint, PrefixProgress, SyncStatus};
pub use waiter::{
    Milestone, MilestoneSignal, MilestoneWaiter, HEIGHT_POLL_INTERVAL, SYNC_POLL_INTERVAL,
};
