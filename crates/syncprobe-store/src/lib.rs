//! # Syncprobe Store
//!
//! Storage abstraction for syncprobe. Provides a trait-based interface over
//! ordered, prefix-partitioned key-value data with SQLite and in-memory
//! implementations.
//!
//! ## Key Types
//!
//! - [`PrefixedStore`] - The paginated range read the verifier depends on
//! - [`KvStore`] - Writes a node performs while syncing
//! - [`SqliteKvStore`] - SQLite-based persistent storage
//! - [`MemoryKvStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use syncprobe_core::KeyPrefix;
//! use syncprobe_store::{PrefixedStore, SqliteKvStore};
//!
//! async fn example() {
//!     let store = SqliteKvStore::open("chain.db").unwrap();
//!     let page = store
//!         .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 4096)
//!         .await
//!         .unwrap();
//!     println!("{} entries, more: {}", page.len(), page.is_full);
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;
pub use traits::{prefix_upper_bound, BatchOp, KvStore, PrefixedStore, StoreExt, WriteBatch};
