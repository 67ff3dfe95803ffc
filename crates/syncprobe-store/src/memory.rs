//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same paging semantics as SQLite
//! but keeps everything in a `BTreeMap` with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use syncprobe_core::{paginate, Chunk, Entry, KeyPrefix};

use crate::error::{Result, StoreError};
use crate::traits::{BatchOp, KvStore, PrefixedStore, WriteBatch};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: RwLock<MemoryKvInner>,
    fail_reads: AtomicBool,
}

#[derive(Default)]
struct MemoryKvInner {
    entries: BTreeMap<Bytes, Bytes>,
    meta: HashMap<String, Vec<u8>>,
}

impl MemoryKvStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.write() {
            for (k, v) in entries {
                inner.entries.insert(k.into(), v.into());
            }
        }
        store
    }

    /// Insert or overwrite a single entry.
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.write_inner()?.entries.insert(key.into(), value.into());
        Ok(())
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.write_inner()?.entries.remove(key))
    }

    /// Number of entries across all prefixes.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent read fail, to exercise error paths.
    pub fn inject_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, MemoryKvInner>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Injected);
        }
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, MemoryKvInner>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl PrefixedStore for MemoryKvStore {
    async fn iterate_prefix(
        &self,
        prefix: &KeyPrefix,
        start_after: Option<&[u8]>,
        max_bytes: usize,
    ) -> Result<Chunk> {
        let inner = self.read_inner()?;

        // A cursor below the prefix means "from the start of the prefix".
        let start = match start_after {
            Some(key) if key >= prefix.as_bytes() => Bound::Excluded(Bytes::copy_from_slice(key)),
            _ => Bound::Included(Bytes::copy_from_slice(prefix.as_bytes())),
        };

        let matching = inner
            .entries
            .range::<Bytes, _>((start, Bound::Unbounded))
            .take_while(|(k, _)| prefix.matches(k))
            .map(|(k, v)| Entry::new(k.clone(), v.clone()));

        Ok(paginate(matching, max_bytes))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.read_inner()?.entries.get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.write_inner()?;
        for op in batch.ops() {
            match op {
                BatchOp::Put(entry) => {
                    inner.entries.insert(entry.key.clone(), entry.value.clone());
                }
                BatchOp::Delete(key) => {
                    inner.entries.remove(key);
                }
            }
        }
        for (name, value) in batch.meta() {
            inner.meta.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read_inner()?.meta.get(name).cloned())
    }

    async fn delete_prefix(&self, prefix: &KeyPrefix) -> Result<usize> {
        let mut inner = self.write_inner()?;
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !prefix.matches(k));
        Ok(before - inner.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use proptest::prelude::*;

    fn seeded() -> MemoryKvStore {
        MemoryKvStore::with_entries(vec![
            (vec![0x01, 0xaa], b"v1".to_vec()),
            (vec![0x01, 0xbb], b"v2".to_vec()),
            (vec![0x01, 0xcc], b"v3".to_vec()),
            (vec![0x02, 0x00], b"other".to_vec()),
        ])
    }

    #[tokio::test]
    async fn test_iterate_stays_within_prefix() {
        let store = seeded();
        let chunk = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 1 << 20)
            .await
            .unwrap();
        assert_eq!(chunk.len(), 3);
        assert!(!chunk.is_full);
    }

    #[tokio::test]
    async fn test_iterate_after_cursor() {
        let store = seeded();
        let chunk = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), Some(&[0x01, 0xaa]), 1 << 20)
            .await
            .unwrap();
        let keys: Vec<_> = chunk.entries.iter().map(Entry::key_hex).collect();
        assert_eq!(keys, vec!["01bb", "01cc"]);
    }

    #[tokio::test]
    async fn test_iterate_includes_bare_prefix_key() {
        let store = MemoryKvStore::with_entries(vec![(vec![0x01], b"root".to_vec())]);
        let chunk = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 1 << 20)
            .await
            .unwrap();
        assert_eq!(chunk.len(), 1);
    }

    #[tokio::test]
    async fn test_paged_iteration_sets_full() {
        let store = seeded();
        // each entry is 4 bytes
        let chunk = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 8)
            .await
            .unwrap();
        assert_eq!(chunk.len(), 2);
        assert!(chunk.is_full);
    }

    #[tokio::test]
    async fn test_write_batch_and_delete_prefix() {
        let store = seeded();
        let mut batch = WriteBatch::new();
        batch
            .put(vec![0x02, 0x01], b"x".to_vec())
            .delete(vec![0x01, 0xaa])
            .set_meta("height", 7u64.to_be_bytes().to_vec());
        store.write(batch).await.unwrap();

        assert!(store.get(&[0x01, 0xaa]).await.unwrap().is_none());
        assert_eq!(store.get(&[0x02, 0x01]).await.unwrap().unwrap().as_ref(), b"x");
        assert_eq!(
            store.get_meta("height").await.unwrap(),
            Some(7u64.to_be_bytes().to_vec())
        );

        let removed = store.delete_prefix(&KeyPrefix::from_byte(0x02)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let store = seeded();
        store.inject_read_failure(true);
        let err = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Injected));
    }

    proptest! {
        #[test]
        fn test_chunks_are_contiguous(
            keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 0..6), 0..40),
            max_bytes in 0usize..64,
        ) {
            let store = MemoryKvStore::new();
            let mut expected = Vec::new();
            for suffix in &keys {
                let mut key = vec![0x07];
                key.extend_from_slice(suffix);
                store.insert(key.clone(), suffix.clone()).unwrap();
                expected.push(key);
            }
            // neighbours outside the prefix must never leak in
            store.insert(vec![0x06, 0xff], b"low".to_vec()).unwrap();
            store.insert(vec![0x08], b"high".to_vec()).unwrap();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let scanned = rt
                .block_on(store.scan_prefix(&KeyPrefix::from_byte(0x07), max_bytes))
                .unwrap();
            let scanned_keys: Vec<Vec<u8>> = scanned.iter().map(|e| e.key.to_vec()).collect();
            prop_assert_eq!(scanned_keys, expected);
        }
    }
}
