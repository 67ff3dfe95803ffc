//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use syncprobe_core::{Entry, KeyPrefix};
use syncprobe_store::{MemoryKvStore, SqliteKvStore, StoreError, WriteBatch};

use crate::chain::{Block, ChainSpec};

/// Contents of a key-value store.
pub type StoreContents = BTreeMap<Vec<u8>, Vec<u8>>;

/// Generate a single-byte prefix among the first `count` bytes.
pub fn prefix(count: u8) -> impl Strategy<Value = KeyPrefix> {
    (0..count.max(1)).prop_map(KeyPrefix::from_byte)
}

/// Generate a key under `prefix` with a suffix of up to `max_suffix` bytes.
pub fn key_under(prefix: KeyPrefix, max_suffix: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_suffix).prop_map(move |suffix| {
        let mut key = prefix.as_bytes().to_vec();
        key.extend(suffix);
        key
    })
}

/// Generate value bytes of up to `max_len` bytes.
pub fn value(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate store contents spread over the first `prefixes` single-byte
/// prefixes. Short suffixes make collisions between two generated stores
/// likely.
pub fn store_contents(prefixes: u8, max_entries: usize) -> impl Strategy<Value = StoreContents> {
    let key = (0..prefixes.max(1), prop::collection::vec(any::<u8>(), 0..3)).prop_map(
        |(first, rest)| {
            let mut key = vec![first];
            key.extend(rest);
            key
        },
    );
    prop::collection::btree_map(key, value(4), 0..=max_entries)
}

/// A change applied to one side of a comparison.
#[derive(Debug, Clone)]
pub enum StoreEdit {
    Insert { key: Vec<u8>, value: Vec<u8> },
    /// Remove the `n`th key (modulo the store size).
    Remove { n: usize },
    /// Replace the `n`th key's value (modulo the store size).
    Change { n: usize, value: Vec<u8> },
}

impl StoreEdit {
    /// Apply to `contents`; returns whether anything changed.
    pub fn apply(&self, contents: &mut StoreContents) -> bool {
        match self {
            StoreEdit::Insert { key, value } => {
                contents.insert(key.clone(), value.clone()).as_ref() != Some(value)
            }
            StoreEdit::Remove { n } => match nth_key(contents, *n) {
                Some(key) => contents.remove(&key).is_some(),
                None => false,
            },
            StoreEdit::Change { n, value } => match nth_key(contents, *n) {
                Some(key) => contents.insert(key, value.clone()).as_ref() != Some(value),
                None => false,
            },
        }
    }
}

fn nth_key(contents: &StoreContents, n: usize) -> Option<Vec<u8>> {
    if contents.is_empty() {
        return None;
    }
    contents.keys().nth(n % contents.len()).cloned()
}

/// Generate an edit touching keys under the first `prefixes` prefixes.
pub fn store_edit(prefixes: u8) -> impl Strategy<Value = StoreEdit> {
    prop_oneof![
        (prefix(prefixes), value(4))
            .prop_flat_map(|(p, v)| (key_under(p, 2), Just(v)))
            .prop_map(|(key, value)| StoreEdit::Insert { key, value }),
        any::<usize>().prop_map(|n| StoreEdit::Remove { n }),
        (any::<usize>(), value(4)).prop_map(|(n, value)| StoreEdit::Change { n, value }),
    ]
}

/// Generate a short deterministic chain from a random seed.
pub fn chain(max_blocks: u64) -> impl Strategy<Value = Vec<Block>> {
    (any::<u64>(), 1..=max_blocks.max(1))
        .prop_map(|(seed, count)| ChainSpec::new(seed).blocks(count))
}

/// Entries of `contents`, in key order.
pub fn entries(contents: &StoreContents) -> Vec<Entry> {
    contents
        .iter()
        .map(|(k, v)| Entry::new(k.clone(), v.clone()))
        .collect()
}

pub fn memory_store(contents: &StoreContents) -> MemoryKvStore {
    MemoryKvStore::with_entries(contents.clone())
}

/// An in-memory SQLite store holding `contents`.
pub async fn sqlite_store(contents: &StoreContents) -> Result<SqliteKvStore, StoreError> {
    use syncprobe_store::KvStore;

    let store = SqliteKvStore::open_memory()?;
    let mut batch = WriteBatch::new();
    for (key, value) in contents {
        batch.put(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
    }
    store.write(batch).await?;
    Ok(store)
}
