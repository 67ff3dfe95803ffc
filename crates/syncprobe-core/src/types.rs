//! Strong type definitions for keys, entries, and paginated chunks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Height of a block in the ledger.
pub type BlockHeight = u64;

/// Default byte budget for one page of a paginated prefix read.
///
/// Snapshot serving and state comparison share this value so that comparison
/// reads page through a store the same way a hypersync peer does.
pub const SNAPSHOT_BATCH_SIZE: usize = 100 << 10;

/// Leading byte(s) of a key identifying its record class.
///
/// Prefixes order byte-lexicographically, which is also the traversal order
/// for every multi-prefix operation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPrefix(Bytes);

impl KeyPrefix {
    /// Create a prefix from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CoreError::EmptyPrefix);
        }
        Ok(Self(bytes))
    }

    /// Create a single-byte prefix.
    pub fn from_byte(byte: u8) -> Self {
        Self(Bytes::copy_from_slice(&[byte]))
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        Self::new(hex::decode(s)?)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Whether `key` belongs to this record class.
    pub fn matches(&self, key: &[u8]) -> bool {
        key.starts_with(&self.0)
    }

    /// Whether either prefix is a prefix of the other.
    pub fn overlaps(&self, other: &KeyPrefix) -> bool {
        self.matches(other.as_bytes()) || other.matches(self.as_bytes())
    }
}

impl fmt::Debug for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPrefix(0x{})", self.to_hex())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl AsRef<[u8]> for KeyPrefix {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<u8> for KeyPrefix {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

/// A single key-value record.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

impl Entry {
    /// Create an entry from anything convertible to bytes.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes this entry counts against a page budget.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Hex rendering of the key, used for reconciliation maps and logs.
    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry({} => {} bytes)", self.key_hex(), self.value.len())
    }
}

/// One page of a paginated prefix read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Entries in ascending key order.
    pub entries: Vec<Entry>,
    /// True iff the store holds more matching entries after the last one.
    pub is_full: bool,
}

impl Chunk {
    /// Key of the final entry, the cursor for the next page.
    pub fn last_key(&self) -> Option<&Bytes> {
        self.entries.last().map(|e| &e.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total key and value bytes in this page.
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(Entry::size).sum()
    }
}

/// Cut one page out of an ordered entry stream.
///
/// Entries are taken until their cumulative size reaches `max_bytes`; a page
/// always holds at least one entry when any remain, so an oversized record
/// cannot stall a scan. The caller is responsible for prefix filtering and for
/// starting the stream after the cursor.
pub fn paginate<I>(entries: I, max_bytes: usize) -> Chunk
where
    I: IntoIterator<Item = Entry>,
{
    let mut iter = entries.into_iter().peekable();
    let mut page = Vec::new();
    let mut total = 0usize;

    while let Some(entry) = iter.next() {
        total += entry.size();
        page.push(entry);
        if total >= max_bytes {
            return Chunk {
                entries: page,
                is_full: iter.peek().is_some(),
            };
        }
    }

    Chunk {
        entries: page,
        is_full: false,
    }
}
