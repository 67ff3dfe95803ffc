//! Store traits: the abstract interface for prefix-partitioned key-value data.
//!
//! [`PrefixedStore`] is the only operation the verification engine needs.
//! [`KvStore`] adds the writes a node performs while syncing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use syncprobe_core::{Chunk, Entry, KeyPrefix};

use crate::error::Result;

/// Paginated, prefix-scoped range reads.
///
/// # Contract
///
/// `iterate_prefix(prefix, start_after, max_bytes)` returns entries whose key
/// starts with `prefix`, in ascending key order, strictly after `start_after`
/// (or from the start of the prefix when `None`). Entries are returned until
/// their cumulative size reaches `max_bytes`, always at least one when any
/// match. `Chunk::is_full` is true iff further matching entries exist.
///
/// Feeding each chunk's last key back as `start_after` visits every matching
/// entry exactly once.
#[async_trait]
pub trait PrefixedStore: Send + Sync {
    async fn iterate_prefix(
        &self,
        prefix: &KeyPrefix,
        start_after: Option<&[u8]>,
        max_bytes: usize,
    ) -> Result<Chunk>;
}

#[async_trait]
impl<S: PrefixedStore + ?Sized> PrefixedStore for Arc<S> {
    async fn iterate_prefix(
        &self,
        prefix: &KeyPrefix,
        start_after: Option<&[u8]>,
        max_bytes: usize,
    ) -> Result<Chunk> {
        (**self).iterate_prefix(prefix, start_after, max_bytes).await
    }
}

/// A single mutation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Entry),
    Delete(Bytes),
}

/// An atomic group of mutations plus node metadata updates.
///
/// Metadata lives outside the keyspace so it never shows up in prefix scans.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    meta: Vec<(String, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(BatchOp::Put(Entry::new(key, value)));
        self
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn set_meta(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.meta.push((name.into(), value.into()));
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn meta(&self) -> &[(String, Vec<u8>)] {
        &self.meta
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.meta.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// A writable store.
#[async_trait]
pub trait KvStore: PrefixedStore {
    /// Point lookup.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Apply a batch atomically.
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Read a metadata value.
    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete every entry under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &KeyPrefix) -> Result<usize>;
}

/// Extension trait for common scan patterns.
pub trait StoreExt: PrefixedStore {
    /// Read every entry under `prefix` by chaining pages of `max_bytes`.
    fn scan_prefix(
        &self,
        prefix: &KeyPrefix,
        max_bytes: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Entry>>> + Send;
}

impl<S: PrefixedStore + ?Sized> StoreExt for S {
    async fn scan_prefix(&self, prefix: &KeyPrefix, max_bytes: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut cursor: Option<Bytes> = None;
        loop {
            let chunk = self
                .iterate_prefix(prefix, cursor.as_deref(), max_bytes)
                .await?;
            let is_full = chunk.is_full;
            cursor = chunk.last_key().cloned();
            out.extend(chunk.entries);
            if !is_full || cursor.is_none() {
                return Ok(out);
            }
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when the prefix is all `0xff` bytes and has no upper bound.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < 0xff {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(&[0x01]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_write_batch_builder() {
        let mut batch = WriteBatch::new();
        batch.put(vec![1u8], vec![2u8]).delete(vec![3u8]).set_meta("height", vec![0u8; 8]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.meta().len(), 1);
        assert!(!batch.is_empty());
    }
}
