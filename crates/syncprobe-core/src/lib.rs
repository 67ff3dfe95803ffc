//! # Syncprobe Core
//!
//! Pure primitives for verifying that two ledger nodes converged to the same
//! persisted state.
//!
//! This crate performs no storage and no networking. It defines the shape of
//! the data being compared and the order-independent digest used to reduce a
//! store's content to a single value.
//!
//! ## Key Types
//!
//! - [`KeyPrefix`] - Leading bytes identifying a record class
//! - [`Entry`] / [`Chunk`] - Key-value pairs and bounded pages of them
//! - [`PrefixRegistry`] - The registered record classes of a ledger
//! - [`Accumulator`] / [`LtHash`] - Commutative, invertible set digest
//! - [`ChecksumAccumulator`] - Asynchronous, migration-aware checksum queue
//!
//! ## Checksums
//!
//! ```rust
//! use syncprobe_core::{ChecksumAccumulator, MigrationSchedule};
//!
//! # async fn example() -> Result<(), syncprobe_core::ChecksumError> {
//! let checksum: ChecksumAccumulator = ChecksumAccumulator::new(MigrationSchedule::default());
//! checksum.initialize()?;
//! checksum.add_or_remove(b"\x01aa", b"v1", 0, true)?;
//! checksum.wait().await?;
//! let bytes = checksum.to_bytes()?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod checksum;
pub mod error;
pub mod prefix;
pub mod types;

pub use accumulator::{Accumulator, LtHash, LTHASH_LANES};
pub use checksum::{ChecksumAccumulator, HashRule, MigrationSchedule, StateDigest};
pub use error::{ChecksumError, CoreError};
pub use prefix::{PrefixInfo, PrefixRegistry};
pub use types::{paginate, BlockHeight, Chunk, Entry, KeyPrefix, SNAPSHOT_BATCH_SIZE};
