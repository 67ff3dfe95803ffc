//! Polling watchers that signal when a node reaches a sync milestone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use syncprobe_core::{BlockHeight, KeyPrefix};

use crate::error::{Result, SyncError};
use crate::node::Node;

/// Poll interval for block height milestones.
pub const HEIGHT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poll interval for full-sync milestones.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A point in a node's sync progress worth waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    /// Block height at or above the given value.
    BlockHeight(BlockHeight),
    /// Hypersync has recorded progress for the prefix.
    SyncPrefix(KeyPrefix),
    /// Fully current, then background work drained.
    FullySynced,
    /// Fully current with every block stored, then background work drained.
    FullyStored,
    /// Transaction index caught up with a fully current chain, then
    /// background work drained.
    TxIndexSynced,
}

impl Milestone {
    fn is_reached(&self, node: &impl Node) -> bool {
        let status = node.sync_status();
        match self {
            Milestone::BlockHeight(height) => status.height >= *height,
            Milestone::SyncPrefix(prefix) => node
                .hypersync_progress()
                .iter()
                .any(|progress| &progress.prefix == prefix),
            Milestone::FullySynced => status.fully_current,
            Milestone::FullyStored => status.fully_current && status.fully_stored,
            Milestone::TxIndexSynced => status.fully_current && status.tx_index_synced,
        }
    }

    fn drains_background(&self) -> bool {
        matches!(
            self,
            Milestone::FullySynced | Milestone::FullyStored | Milestone::TxIndexSynced
        )
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::BlockHeight(h) => write!(f, "block height {}", h),
            Milestone::SyncPrefix(p) => write!(f, "sync prefix {}", p),
            Milestone::FullySynced => write!(f, "fully synced"),
            Milestone::FullyStored => write!(f, "fully synced and stored"),
            Milestone::TxIndexSynced => write!(f, "tx index synced"),
        }
    }
}

/// Fires once when the watched milestone is reached.
#[derive(Debug)]
pub struct MilestoneSignal {
    milestone: Milestone,
    rx: oneshot::Receiver<Result<()>>,
}

impl MilestoneSignal {
    pub fn milestone(&self) -> &Milestone {
        &self.milestone
    }

    /// Wait for the signal.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::WatcherClosed(self.milestone.to_string())),
        }
    }

    /// Non-blocking check; `true` once the milestone has been signalled.
    pub fn is_fired(&mut self) -> bool {
        matches!(self.rx.try_recv(), Ok(Ok(())))
    }
}

/// Spawns milestone watchers.
#[derive(Debug, Clone, Copy)]
pub struct MilestoneWaiter {
    height_poll: Duration,
    sync_poll: Duration,
}

impl Default for MilestoneWaiter {
    fn default() -> Self {
        Self {
            height_poll: HEIGHT_POLL_INTERVAL,
            sync_poll: SYNC_POLL_INTERVAL,
        }
    }
}

impl MilestoneWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_height_poll(mut self, interval: Duration) -> Self {
        self.height_poll = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_sync_poll(mut self, interval: Duration) -> Self {
        self.sync_poll = interval.max(Duration::from_millis(1));
        self
    }

    /// Spawn a watcher and return its signal without waiting.
    ///
    /// The watcher keeps polling across node restarts. Dropping the signal
    /// stops it at the next poll.
    pub fn listen<N: Node>(&self, node: Arc<N>, milestone: Milestone) -> MilestoneSignal {
        let (tx, rx) = oneshot::channel();
        let period = match milestone {
            Milestone::BlockHeight(_) | Milestone::SyncPrefix(_) => self.height_poll,
            _ => self.sync_poll,
        };
        let target = milestone.clone();

        tokio::spawn(async move {
            let mut tx = tx;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => return,
                }
                if target.is_reached(&*node) {
                    break;
                }
            }
            tracing::debug!(node = %node.endpoint_name(), milestone = %target, "milestone reached");

            let result = if target.drains_background() {
                node.wait_for_background_idle().await
            } else {
                Ok(())
            };
            let _ = tx.send(result);
        });

        MilestoneSignal { milestone, rx }
    }

    /// Block until the milestone is reached.
    pub async fn wait<N: Node>(&self, node: Arc<N>, milestone: Milestone) -> Result<()> {
        self.listen(node, milestone).wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use syncprobe_store::MemoryKvStore;

    use crate::node::{LinkDirection, PeerConnection, PeerEndpoint, PrefixProgress, SyncStatus};

    #[derive(Default)]
    struct ScriptedNode {
        height: AtomicU64,
        current: AtomicBool,
        tx_index: AtomicBool,
        idle_calls: AtomicU64,
        progress: Mutex<Vec<PrefixProgress>>,
    }

    impl PeerEndpoint for ScriptedNode {
        fn endpoint_name(&self) -> String {
            "scripted".into()
        }

        fn is_reachable(&self) -> bool {
            true
        }

        fn attach_peer(&self, _: PeerConnection, _: LinkDirection, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Node for ScriptedNode {
        type Store = MemoryKvStore;

        fn is_running(&self) -> bool {
            true
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn sync_status(&self) -> SyncStatus {
            SyncStatus {
                height: self.height.load(Ordering::SeqCst),
                fully_current: self.current.load(Ordering::SeqCst),
                fully_stored: self.current.load(Ordering::SeqCst),
                tx_index_synced: self.current.load(Ordering::SeqCst)
                    && self.tx_index.load(Ordering::SeqCst),
            }
        }

        async fn wait_for_background_idle(&self) -> Result<()> {
            self.idle_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn snapshot_checksum(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn chain_store(&self) -> Arc<MemoryKvStore> {
            Arc::new(MemoryKvStore::new())
        }

        fn tx_index_store(&self) -> Option<Arc<MemoryKvStore>> {
            None
        }

        fn hypersync_progress(&self) -> Vec<PrefixProgress> {
            self.progress.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_height_signal_fires_once_reached() {
        let node = Arc::new(ScriptedNode::default());
        let waiter = MilestoneWaiter::new();
        let mut signal = waiter.listen(Arc::clone(&node), Milestone::BlockHeight(10));

        node.height.store(9, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!signal.is_fired());

        node.height.store(12, Ordering::SeqCst);
        signal.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_already_reached_fires_immediately() {
        let node = Arc::new(ScriptedNode::default());
        node.height.store(100, Ordering::SeqCst);
        MilestoneWaiter::new()
            .wait(node, Milestone::BlockHeight(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_sync_drains_background_work() {
        let node = Arc::new(ScriptedNode::default());
        let signal = MilestoneWaiter::new().listen(Arc::clone(&node), Milestone::FullySynced);
        node.current.store(true, Ordering::SeqCst);
        signal.wait().await.unwrap();
        assert_eq!(node.idle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tx_index_sync_drains_background_work() {
        let node = Arc::new(ScriptedNode::default());
        node.tx_index.store(true, Ordering::SeqCst);
        let mut signal =
            MilestoneWaiter::new().listen(Arc::clone(&node), Milestone::TxIndexSynced);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!signal.is_fired());

        node.current.store(true, Ordering::SeqCst);
        signal.wait().await.unwrap();
        assert_eq!(node.idle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_prefix_signal() {
        let node = Arc::new(ScriptedNode::default());
        let prefix = KeyPrefix::from_byte(0x02);
        let signal = MilestoneWaiter::new()
            .listen(Arc::clone(&node), Milestone::SyncPrefix(prefix.clone()));

        node.progress.lock().unwrap().push(PrefixProgress {
            prefix,
            last_received_key: None,
            completed: false,
        });
        signal.wait().await.unwrap();
        assert_eq!(node.idle_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_milestone_display() {
        assert_eq!(Milestone::BlockHeight(7).to_string(), "block height 7");
        assert_eq!(
            Milestone::SyncPrefix(KeyPrefix::from_byte(0x05)).to_string(),
            "sync prefix 0x05"
        );
    }
}
