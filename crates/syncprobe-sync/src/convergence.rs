//! State equivalence checking between two stores.
//!
//! [`StateDiffer`] walks both stores prefix by prefix in lock-step pages and
//! classifies every difference it sees. Two stores pass a prefix exactly when
//! they hold the same `(key, value)` pairs under it, regardless of the page
//! budget used or which store is passed first.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use syncprobe_core::{Chunk, KeyPrefix, SNAPSHOT_BATCH_SIZE};
use syncprobe_store::PrefixedStore;

use crate::error::{Result, StoreSide, SyncError};

/// Divergences kept as structured samples per prefix.
pub const MAX_RECORDED_DIVERGENCES: usize = 32;

/// How keys present only in the first store are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualPolicy {
    /// Logged and reported, but not a failure on their own.
    #[default]
    Diagnostic,
    /// Any residual key fails the prefix.
    Fatal,
}

/// Classification of a divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DivergenceKind {
    Length,
    Key,
    KeyOrder,
    Value,
    Pagination,
}

/// A single observed difference between the two stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// Chunks fetched at the same cursor have different entry counts.
    Length {
        cursor: String,
        len_a: usize,
        len_b: usize,
    },
    /// A key in B's chunk that A has not produced so far.
    UnmatchedKey { key: String, value_len: usize },
    /// Keys at the same position of the two chunks differ.
    KeyOrder {
        cursor: String,
        index: usize,
        key_a: String,
        key_b: String,
    },
    /// Same key, different value.
    Value {
        key: String,
        value_a: Bytes,
        value_b: Bytes,
    },
    /// One store reported more data at this cursor and the other did not.
    Pagination {
        cursor: String,
        full_a: bool,
        full_b: bool,
    },
}

impl Divergence {
    pub fn kind(&self) -> DivergenceKind {
        match self {
            Divergence::Length { .. } => DivergenceKind::Length,
            Divergence::UnmatchedKey { .. } => DivergenceKind::Key,
            Divergence::KeyOrder { .. } => DivergenceKind::KeyOrder,
            Divergence::Value { .. } => DivergenceKind::Value,
            Divergence::Pagination { .. } => DivergenceKind::Pagination,
        }
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::Length {
                cursor,
                len_a,
                len_b,
            } => write!(
                f,
                "chunk length mismatch after {}: A has {}, B has {}",
                cursor, len_a, len_b
            ),
            Divergence::UnmatchedKey { key, value_len } => write!(
                f,
                "key {} (value len {}) present in B but not in A",
                key, value_len
            ),
            Divergence::KeyOrder {
                cursor,
                index,
                key_a,
                key_b,
            } => write!(
                f,
                "keys differ at position {} after {}: A {} vs B {}",
                index, cursor, key_a, key_b
            ),
            Divergence::Value { key, value_a, value_b } => write!(
                f,
                "value mismatch at key {}: A {} vs B {}",
                key,
                hex::encode(value_a),
                hex::encode(value_b)
            ),
            Divergence::Pagination {
                cursor,
                full_a,
                full_b,
            } => write!(
                f,
                "pagination differs after {}: A is_full={} vs B is_full={}",
                cursor, full_a, full_b
            ),
        }
    }
}

/// Per-kind divergence counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DivergenceCounts {
    pub length: usize,
    pub key: usize,
    pub key_order: usize,
    pub value: usize,
    pub pagination: usize,
}

impl DivergenceCounts {
    pub fn total(&self) -> usize {
        self.length + self.key + self.key_order + self.value + self.pagination
    }

    pub fn get(&self, kind: DivergenceKind) -> usize {
        match kind {
            DivergenceKind::Length => self.length,
            DivergenceKind::Key => self.key,
            DivergenceKind::KeyOrder => self.key_order,
            DivergenceKind::Value => self.value,
            DivergenceKind::Pagination => self.pagination,
        }
    }

    fn bump(&mut self, kind: DivergenceKind) -> usize {
        let slot = match kind {
            DivergenceKind::Length => &mut self.length,
            DivergenceKind::Key => &mut self.key,
            DivergenceKind::KeyOrder => &mut self.key_order,
            DivergenceKind::Value => &mut self.value,
            DivergenceKind::Pagination => &mut self.pagination,
        };
        *slot += 1;
        *slot
    }
}

/// Outcome of comparing one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixReport {
    pub prefix: KeyPrefix,
    /// Chunk pairs fetched.
    pub chunks: usize,
    pub entries_a: usize,
    pub entries_b: usize,
    pub counts: DivergenceCounts,
    /// First divergences observed, capped at [`MAX_RECORDED_DIVERGENCES`].
    pub samples: Vec<Divergence>,
    /// Hex keys present in A and never matched in B, sorted.
    pub residual_keys: Vec<String>,
    pub residual_policy: ResidualPolicy,
}

impl PrefixReport {
    fn new(prefix: KeyPrefix, residual_policy: ResidualPolicy) -> Self {
        Self {
            prefix,
            chunks: 0,
            entries_a: 0,
            entries_b: 0,
            counts: DivergenceCounts::default(),
            samples: Vec::new(),
            residual_keys: Vec::new(),
            residual_policy,
        }
    }

    pub fn passed(&self) -> bool {
        let residual_fails =
            self.residual_policy == ResidualPolicy::Fatal && !self.residual_keys.is_empty();
        self.counts.total() == 0 && !residual_fails
    }

    pub fn status(&self) -> &'static str {
        if self.passed() {
            "PASS"
        } else {
            "FAIL"
        }
    }
}

/// Outcome of a full comparison, one entry per prefix in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffReport {
    pub prefixes: Vec<PrefixReport>,
}

impl DiffReport {
    pub fn is_match(&self) -> bool {
        self.prefixes.iter().all(PrefixReport::passed)
    }

    /// Every failing prefix, ascending.
    pub fn failing_prefixes(&self) -> Vec<KeyPrefix> {
        self.prefixes
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.prefix.clone())
            .collect()
    }

    pub fn prefix(&self, prefix: &KeyPrefix) -> Option<&PrefixReport> {
        self.prefixes.iter().find(|r| &r.prefix == prefix)
    }

    /// Convert a failing report into [`SyncError::StatesDiverged`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_match() {
            Ok(self)
        } else {
            Err(SyncError::StatesDiverged {
                prefixes: self.failing_prefixes(),
            })
        }
    }
}

/// Compares two prefixed stores page by page.
#[derive(Debug, Clone, Copy)]
pub struct StateDiffer {
    max_bytes: usize,
    verbose: u8,
    residual_policy: ResidualPolicy,
}

impl Default for StateDiffer {
    fn default() -> Self {
        Self {
            max_bytes: SNAPSHOT_BATCH_SIZE,
            verbose: 0,
            residual_policy: ResidualPolicy::Diagnostic,
        }
    }
}

impl StateDiffer {
    /// Differ with a page budget of `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
            ..Self::default()
        }
    }

    /// Log every divergence rather than the first of each kind per prefix.
    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_residual_policy(mut self, policy: ResidualPolicy) -> Self {
        self.residual_policy = policy;
        self
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Compare `a` and `b` under every prefix in `prefixes`.
    ///
    /// Prefixes are deduplicated and walked in ascending order. Divergence is
    /// reported in the returned [`DiffReport`]; only store read failures are
    /// returned as errors.
    pub async fn compare<A, B>(&self, a: &A, b: &B, prefixes: &[KeyPrefix]) -> Result<DiffReport>
    where
        A: PrefixedStore + ?Sized,
        B: PrefixedStore + ?Sized,
    {
        let mut ordered = prefixes.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut report = DiffReport::default();
        for prefix in ordered {
            let prefix_report = self.compare_prefix(a, b, &prefix).await?;
            tracing::info!(
                prefix = %prefix,
                status = prefix_report.status(),
                chunks = prefix_report.chunks,
                entries_a = prefix_report.entries_a,
                entries_b = prefix_report.entries_b,
                divergences = prefix_report.counts.total(),
                "compared prefix"
            );
            report.prefixes.push(prefix_report);
        }

        if !report.is_match() {
            tracing::error!(broken = ?report.failing_prefixes(), "databases differ");
        }
        Ok(report)
    }

    async fn compare_prefix<A, B>(&self, a: &A, b: &B, prefix: &KeyPrefix) -> Result<PrefixReport>
    where
        A: PrefixedStore + ?Sized,
        B: PrefixedStore + ?Sized,
    {
        let mut report = PrefixReport::new(prefix.clone(), self.residual_policy);
        let mut seen_a: HashMap<String, Bytes> = HashMap::new();
        let mut cursor: Option<Bytes> = None;

        loop {
            let cursor_label = cursor_label(&cursor);
            let chunk_a = self.fetch(a, StoreSide::A, prefix, &cursor).await?;
            for entry in &chunk_a.entries {
                seen_a.insert(entry.key_hex(), entry.value.clone());
            }
            let chunk_b = self.fetch(b, StoreSide::B, prefix, &cursor).await?;

            report.chunks += 1;
            report.entries_a += chunk_a.len();
            report.entries_b += chunk_b.len();

            for entry in &chunk_b.entries {
                let key = entry.key_hex();
                match seen_a.remove(&key) {
                    Some(value_a) if value_a != entry.value => self.record(
                        &mut report,
                        Divergence::Value {
                            key,
                            value_a,
                            value_b: entry.value.clone(),
                        },
                    ),
                    Some(_) => {}
                    None => self.record(
                        &mut report,
                        Divergence::UnmatchedKey {
                            key,
                            value_len: entry.value.len(),
                        },
                    ),
                }
            }

            if chunk_a.len() != chunk_b.len() {
                self.record(
                    &mut report,
                    Divergence::Length {
                        cursor: cursor_label.clone(),
                        len_a: chunk_a.len(),
                        len_b: chunk_b.len(),
                    },
                );
            }

            for (index, (ea, eb)) in chunk_a.entries.iter().zip(&chunk_b.entries).enumerate() {
                if ea.key != eb.key {
                    self.record(
                        &mut report,
                        Divergence::KeyOrder {
                            cursor: cursor_label.clone(),
                            index,
                            key_a: ea.key_hex(),
                            key_b: eb.key_hex(),
                        },
                    );
                }
            }

            if chunk_a.is_full != chunk_b.is_full {
                self.record(
                    &mut report,
                    Divergence::Pagination {
                        cursor: cursor_label,
                        full_a: chunk_a.is_full,
                        full_b: chunk_b.is_full,
                    },
                );
            }

            match chunk_a.last_key() {
                Some(last) if chunk_a.is_full => cursor = Some(last.clone()),
                _ => break,
            }
        }

        let mut residual: Vec<(String, Bytes)> = seen_a.into_iter().collect();
        residual.sort();
        if !residual.is_empty() {
            tracing::info!(
                prefix = %prefix,
                count = residual.len(),
                "keys present in A but never matched in B"
            );
            for (key, value) in &residual {
                tracing::info!(
                    prefix = %prefix,
                    key = %key,
                    value_len = value.len(),
                    "residual key"
                );
            }
        }
        report.residual_keys = residual.into_iter().map(|(key, _)| key).collect();

        Ok(report)
    }

    async fn fetch<S>(
        &self,
        store: &S,
        side: StoreSide,
        prefix: &KeyPrefix,
        cursor: &Option<Bytes>,
    ) -> Result<Chunk>
    where
        S: PrefixedStore + ?Sized,
    {
        store
            .iterate_prefix(prefix, cursor.as_deref(), self.max_bytes)
            .await
            .map_err(|source| SyncError::StoreRead {
                side,
                prefix: prefix.clone(),
                cursor: cursor_label(cursor),
                source,
            })
    }

    fn record(&self, report: &mut PrefixReport, divergence: Divergence) {
        let seen = report.counts.bump(divergence.kind());
        if seen == 1 || self.verbose >= 1 {
            tracing::error!(prefix = %report.prefix, "{}", divergence);
        }
        if report.samples.len() < MAX_RECORDED_DIVERGENCES {
            report.samples.push(divergence);
        }
    }
}

fn cursor_label(cursor: &Option<Bytes>) -> String {
    match cursor {
        Some(key) => hex::encode(key),
        None => "<start>".to_string(),
    }
}
