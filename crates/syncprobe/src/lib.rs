//! # Syncprobe
//!
//! Verifies that ledger nodes which reached the same height by different
//! paths (full block sync, interrupted sync, snapshot-based hypersync) hold
//! byte-identical state.
//!
//! ## Overview
//!
//! A scenario starts nodes, links them, injects faults at chosen heights or
//! sync stages, waits for them to catch up, and then compares them:
//!
//! - **Store comparison**: prefix-by-prefix paged diff of two stores
//! - **Checksum comparison**: the nodes' own order-independent state checksums
//! - **Checksum recomputation**: rebuild a checksum from a store to validate
//!   the node's incremental one
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncprobe::{ScenarioConfig, ScenarioDriver};
//!
//! async fn scenario(registry: PrefixRegistry, source: Arc<MyNode>, fresh: Arc<MyNode>) {
//!     let driver = ScenarioDriver::new(ScenarioConfig::default(), registry);
//!     driver.start_node(&source).await?;
//!     driver.start_node(&fresh).await?;
//!
//!     let link = driver.bridge(&fresh, &source)?;
//!     let link = driver
//!         .restart_at_height_and_reconnect_node(&fresh, &source, &link, 500)
//!         .await?;
//!
//!     driver.wait_for_node_to_fully_sync(&fresh).await?;
//!     driver.assert_converged(&fresh, &source).await?;
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `syncprobe::core` - Prefixes, chunks, accumulators and checksums
//! - `syncprobe::store` - Store traits, SQLite and in-memory stores
//! - `syncprobe::sync` - Node traits, links, waiters and the state differ

pub mod config;
pub mod driver;
pub mod error;

// Re-export component crates
pub use syncprobe_core as core;
pub use syncprobe_store as store;
pub use syncprobe_sync as sync;

pub use config::{
    ScenarioConfig, DEFAULT_MAX_SYNC_HEIGHT, DEFAULT_SETTLE_DELAY, DEFAULT_SNAPSHOT_PERIOD,
};
pub use driver::{random_height_between, ScenarioDriver};
pub use error::{Result, ScenarioError};

// Re-export commonly used types
pub use syncprobe_core::{BlockHeight, KeyPrefix, PrefixInfo, PrefixRegistry};
pub use syncprobe_sync::{
    DiffReport, Milestone, MilestoneSignal, NetworkLink, Node, PeerEndpoint, ResidualPolicy,
    StateDiffer,
};
