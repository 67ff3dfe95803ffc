//! # syncprobe testkit
//!
//! A simulated ledger network for exercising [`syncprobe`] scenarios.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Chain**: a deterministic toy ledger with account balances and posts,
//!   state and auxiliary key prefixes, and a checksum migration height
//! - **Nodes**: [`SimNode`], a SQLite-backed node that produces, serves and
//!   syncs that chain over [`NetworkLink`](syncprobe::NetworkLink)s, by
//!   block sync or snapshot hypersync
//! - **Fixtures**: [`TestNetwork`] for spinning up nodes in a temp directory
//! - **Generators**: proptest strategies for store contents and chains
//!
//! ## Example
//!
//! ```rust,no_run
//! use syncprobe_testkit::TestNetwork;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let net = TestNetwork::new(200, 100)?;
//! let driver = net.driver();
//!
//! let source = net.producer("source")?;
//! let fresh = net.hypersync_node("fresh")?;
//! driver.start_node(&source).await?;
//! driver.start_node(&fresh).await?;
//!
//! let _link = driver.bridge(&source, &fresh)?;
//! driver.wait_for_node_to_fully_sync(&fresh).await?;
//! driver.assert_converged(&source, &fresh).await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod fixtures;
pub mod generators;
pub mod node;
pub mod wire;

pub use chain::{Block, ChainSpec, Tx};
pub use config::{SimNodeConfig, SyncMode};
pub use fixtures::{init_tracing, TestNetwork};
pub use generators::{StoreContents, StoreEdit};
pub use node::SimNode;
pub use wire::Message;
