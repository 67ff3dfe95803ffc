//! Asynchronous, migration-aware state checksum.
//!
//! [`ChecksumAccumulator`] reduces a set of key-value records to a digest that
//! is independent of insertion order. Each `add_or_remove` call is queued on
//! the Tokio blocking pool and folded into shared state when it runs;
//! [`wait`](ChecksumAccumulator::wait) drains the queue.
//!
//! The mapping from a record to its contribution can change over the life of
//! a ledger. A [`MigrationSchedule`] selects the [`HashRule`] in effect at a
//! given block height, so a record hashed at `context_height` uses the same
//! rule on every node.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::accumulator::{Accumulator, LtHash};
use crate::error::ChecksumError;
use crate::types::BlockHeight;

/// Result type for checksum operations.
pub type Result<T> = std::result::Result<T, ChecksumError>;

/// How a record is encoded before being mapped to an accumulator element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashRule {
    /// `key || value`.
    Concat,
    /// `u32_be(len(key)) || key || value`, unambiguous across key lengths.
    LengthPrefixed,
}

impl HashRule {
    /// Encode a record under this rule.
    pub fn preimage(&self, key: &[u8], value: &[u8]) -> Vec<u8> {
        match self {
            HashRule::Concat => {
                let mut out = Vec::with_capacity(key.len() + value.len());
                out.extend_from_slice(key);
                out.extend_from_slice(value);
                out
            }
            HashRule::LengthPrefixed => {
                let mut out = Vec::with_capacity(4 + key.len() + value.len());
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(value);
                out
            }
        }
    }
}

/// Hash rules keyed by activation height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSchedule {
    /// Sorted by activation height; the first step activates at height 0.
    steps: Vec<(BlockHeight, HashRule)>,
}

impl MigrationSchedule {
    /// A schedule with a single rule active from genesis.
    pub fn new(initial: HashRule) -> Self {
        Self {
            steps: vec![(0, initial)],
        }
    }

    /// Activate `rule` from `height` onward.
    ///
    /// A step at an existing height replaces it.
    pub fn with_migration(mut self, height: BlockHeight, rule: HashRule) -> Self {
        match self.steps.binary_search_by_key(&height, |(h, _)| *h) {
            Ok(idx) => self.steps[idx].1 = rule,
            Err(idx) => self.steps.insert(idx, (height, rule)),
        }
        self
    }

    /// The rule with the greatest activation height `<= height`.
    pub fn rule_at(&self, height: BlockHeight) -> HashRule {
        self.steps
            .iter()
            .rev()
            .find(|(activation, _)| *activation <= height)
            .map(|(_, rule)| *rule)
            .unwrap_or(HashRule::Concat)
    }

    /// Heights at which the rule changes, excluding genesis.
    pub fn activation_heights(&self) -> impl Iterator<Item = BlockHeight> + '_ {
        self.steps.iter().map(|(h, _)| *h).filter(|h| *h > 0)
    }

    /// Whether the rule in effect differs between the two heights.
    pub fn crosses_migration(&self, from: BlockHeight, to: BlockHeight) -> bool {
        self.rule_at(from) != self.rule_at(to)
    }
}

impl Default for MigrationSchedule {
    fn default() -> Self {
        Self::new(HashRule::Concat)
    }
}

/// A 32-byte compressed checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateDigest(pub [u8; 32]);

impl StateDigest {
    /// Compress an accumulator serialization.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Decrements the pending counter when a queued operation finishes, and
/// latches a failure if it finished by panicking or returned an error.
struct PendingGuard {
    pending: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
}

impl PendingGuard {
    /// Latch `result` before releasing the pending slot, so `to_bytes` never
    /// sees a drained queue without the failure.
    fn finish(self, result: Result<()>) -> Result<()> {
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }
}

fn fold_record<A: Accumulator>(
    state: &Mutex<Option<A>>,
    preimage: &[u8],
    is_add: bool,
) -> Result<()> {
    let element = A::element(preimage);
    let mut state = state.lock().map_err(|_| ChecksumError::Poisoned)?;
    let acc = state.as_mut().ok_or(ChecksumError::NotInitialized)?;
    if is_add {
        acc.fold_in(&element);
    } else {
        acc.fold_out(&element);
    }
    Ok(())
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.failed.store(true, Ordering::SeqCst);
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Order-independent checksum over key-value records.
///
/// Safe to share between tasks: state, queue and counters are internally
/// synchronized. `add_or_remove` must be called from within a Tokio runtime.
pub struct ChecksumAccumulator<A: Accumulator = LtHash> {
    schedule: MigrationSchedule,
    /// `None` until `initialize()` is called.
    state: Arc<Mutex<Option<A>>>,
    tasks: Mutex<JoinSet<Result<()>>>,
    pending: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
}

impl<A: Accumulator> ChecksumAccumulator<A> {
    /// Create an uninitialized accumulator.
    pub fn new(schedule: MigrationSchedule) -> Self {
        Self {
            schedule,
            state: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(JoinSet::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The migration schedule this accumulator hashes with.
    pub fn schedule(&self) -> &MigrationSchedule {
        &self.schedule
    }

    /// Reset to the identity value.
    ///
    /// Fails if operations are still queued, since they would fold into the
    /// fresh state.
    pub fn initialize(&self) -> Result<()> {
        let pending = self.pending.load(Ordering::SeqCst);
        if pending > 0 {
            return Err(ChecksumError::PendingOperations(pending));
        }
        let mut state = self.state.lock().map_err(|_| ChecksumError::Poisoned)?;
        *state = Some(A::identity());
        self.failed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Queue folding a record in (`is_add`) or out of the checksum.
    ///
    /// The record is hashed with the rule in effect at `context_height`.
    pub fn add_or_remove(
        &self,
        key: &[u8],
        value: &[u8],
        context_height: BlockHeight,
        is_add: bool,
    ) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| ChecksumError::NoRuntime)?;
        {
            let state = self.state.lock().map_err(|_| ChecksumError::Poisoned)?;
            if state.is_none() {
                return Err(ChecksumError::NotInitialized);
            }
        }

        let preimage = self.schedule.rule_at(context_height).preimage(key, value);
        let state = Arc::clone(&self.state);

        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            failed: Arc::clone(&self.failed),
        };

        let mut tasks = self.tasks.lock().map_err(|_| ChecksumError::Poisoned)?;
        tasks.spawn_blocking_on(
            move || guard.finish(fold_record(&state, &preimage, is_add)),
            &handle,
        );
        Ok(())
    }

    /// Wait for every operation queued before this call.
    ///
    /// Returns the first failure among them, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut tasks = {
            let mut guard = self.tasks.lock().map_err(|_| ChecksumError::Poisoned)?;
            std::mem::take(&mut *guard)
        };

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(ChecksumError::TaskFailed(e.to_string())),
            };
            if let Err(e) = outcome {
                tracing::error!("checksum operation failed: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of queued operations that have not completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Serialize the current value.
    ///
    /// Errors while operations are pending or after any operation failed;
    /// call [`wait`](Self::wait) first.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let pending = self.pending();
        if pending > 0 {
            return Err(ChecksumError::PendingOperations(pending));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(ChecksumError::OperationFailed);
        }
        let state = self.state.lock().map_err(|_| ChecksumError::Poisoned)?;
        state
            .as_ref()
            .map(A::to_bytes)
            .ok_or(ChecksumError::NotInitialized)
    }

    /// Compressed form of [`to_bytes`](Self::to_bytes).
    pub fn digest(&self) -> Result<StateDigest> {
        Ok(StateDigest::of(&self.to_bytes()?))
    }
}

impl<A: Accumulator> fmt::Debug for ChecksumAccumulator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumAccumulator")
            .field("schedule", &self.schedule)
            .field("pending", &self.pending())
            .field("failed", &self.failed.load(Ordering::SeqCst))
            .finish()
    }
}
