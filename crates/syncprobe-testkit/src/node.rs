//! A simulated ledger node.
//!
//! [`SimNode`] persists its chain in SQLite under its data directory, talks
//! to peers over the framed protocol in [`wire`](crate::wire), and keeps an
//! incremental state checksum. It supports block sync, snapshot-based
//! hypersync (optionally archival), a transaction index, and restarts that
//! recover from disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use syncprobe_core::{
    BlockHeight, ChecksumAccumulator, KeyPrefix, PrefixRegistry, SNAPSHOT_BATCH_SIZE,
};
use syncprobe_store::{KvStore, PrefixedStore, SqliteKvStore, StoreExt, WriteBatch};
use syncprobe_sync::{
    LinkDirection, Node, PeerConnection, PeerEndpoint, PrefixProgress, SyncError, SyncStatus,
};

use crate::chain::{self, Block, ChainSpec};
use crate::config::{SimNodeConfig, SyncMode};
use crate::wire::{read_frame, write_frame, Message};

const META_HEIGHT: &str = "height";
const META_HYPERSYNC: &str = "hypersync_target";
const META_BODIES_MISSING: &str = "bodies_missing_through";
const META_SNAPSHOT: &str = "snapshot_height";

/// Headers served per request.
const HEADER_BATCH: BlockHeight = 500;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn height_bytes(height: BlockHeight) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

/// Decode a height meta value; absent or empty means zero.
fn decode_height(meta: Option<Vec<u8>>) -> BlockHeight {
    meta.and_then(|v| <[u8; 8]>::try_from(v).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn is_set(meta: &Option<Vec<u8>>) -> bool {
    meta.as_ref().is_some_and(|v| !v.is_empty())
}

fn to_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

fn node_error(name: &str, err: anyhow::Error) -> SyncError {
    SyncError::node(name, format!("{:#}", err))
}

#[derive(Debug, Clone, Default)]
struct Status {
    running: bool,
    height: BlockHeight,
    snapshot_height: BlockHeight,
    fully_current: bool,
    bodies_missing: bool,
}

/// State shared between the node handle and its peer sessions.
struct Shared {
    name: String,
    config: SimNodeConfig,
    chain: ChainSpec,
    registry: PrefixRegistry,
    store: Arc<SqliteKvStore>,
    snapshot: SqliteKvStore,
    tx_index: Option<Arc<SqliteKvStore>>,
    checksum: ChecksumAccumulator,
    status: Mutex<Status>,
    progress: Mutex<Vec<PrefixProgress>>,
    apply: tokio::sync::Mutex<()>,
    syncing: tokio::sync::Mutex<()>,
    peers: AtomicUsize,
}

/// One outstanding request at a time over a peer session.
struct Requester {
    out: mpsc::Sender<Message>,
    responses: mpsc::Receiver<Message>,
}

impl Requester {
    async fn call(&mut self, request: Message) -> anyhow::Result<Message> {
        self.out
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("peer connection closed"))?;
        self.responses
            .recv()
            .await
            .context("peer connection closed")
    }
}

impl Shared {
    fn status(&self) -> Status {
        lock(&self.status).clone()
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        f(&mut lock(&self.status));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────

    async fn load(&self) -> anyhow::Result<()> {
        let target = self.store.get_meta(META_HYPERSYNC).await?;
        if is_set(&target) {
            tracing::warn!(
                node = %self.name,
                target = decode_height(target),
                "discarding incomplete hypersync"
            );
            self.wipe_hypersync().await?;
        }

        let height = decode_height(self.store.get_meta(META_HEIGHT).await?);
        let snapshot_height = decode_height(self.snapshot.get_meta(META_SNAPSHOT).await?);
        let bodies_missing = is_set(&self.store.get_meta(META_BODIES_MISSING).await?);
        lock(&self.progress).clear();
        self.update(|s| {
            s.height = height;
            s.snapshot_height = snapshot_height;
            s.bodies_missing = bodies_missing;
            s.fully_current = false;
        });

        self.rebuild_checksum(height).await?;
        tracing::info!(node = %self.name, height, snapshot_height, "loaded chain");
        Ok(())
    }

    async fn wipe_hypersync(&self) -> anyhow::Result<()> {
        let mut removed = 0;
        for prefix in self.registry.state_prefixes() {
            removed += self.store.delete_prefix(&prefix).await?;
        }
        removed += self
            .store
            .delete_prefix(&KeyPrefix::from_byte(chain::BLOCK_HASHES))
            .await?;

        let mut batch = WriteBatch::new();
        batch
            .set_meta(META_HYPERSYNC, Vec::<u8>::new())
            .set_meta(META_HEIGHT, height_bytes(0));
        self.store.write(batch).await?;
        tracing::debug!(node = %self.name, removed, "wiped partial hypersync state");
        Ok(())
    }

    /// Recompute the checksum from the state prefixes, hashing at `height`.
    async fn rebuild_checksum(&self, height: BlockHeight) -> anyhow::Result<()> {
        if let Err(e) = self.checksum.wait().await {
            tracing::warn!(node = %self.name, error = %e, "discarding failed checksum state");
        }
        self.checksum.initialize()?;
        for prefix in self.registry.state_prefixes() {
            for entry in self.store.scan_prefix(&prefix, SNAPSHOT_BATCH_SIZE).await? {
                self.checksum
                    .add_or_remove(&entry.key, &entry.value, height, true)?;
            }
        }
        self.checksum.wait().await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chain updates
    // ─────────────────────────────────────────────────────────────────────

    async fn hash_at(&self, height: BlockHeight) -> anyhow::Result<[u8; 32]> {
        if height == 0 {
            return Ok([0u8; 32]);
        }
        let hash = self
            .store
            .get(&chain::hash_key(height))
            .await?
            .with_context(|| format!("no block hash at height {}", height))?;
        <[u8; 32]>::try_from(&hash[..]).context("malformed block hash")
    }

    async fn produce(&self) -> anyhow::Result<()> {
        let target = self.config.max_sync_height;
        loop {
            let height = self.status().height;
            if height >= target {
                break;
            }
            let prev = self.hash_at(height).await?;
            let block = self.chain.block(height + 1, prev);
            self.apply_block(&block).await?;
        }
        self.update(|s| s.fully_current = true);
        tracing::info!(node = %self.name, height = target, "chain produced");
        Ok(())
    }

    async fn apply_block(&self, block: &Block) -> anyhow::Result<()> {
        let _guard = self.apply.lock().await;
        let parent = self.status().height;
        let height = parent + 1;
        if block.height != height {
            bail!("expected block {}, got {}", height, block.height);
        }
        if block.prev_hash != self.hash_at(parent).await? {
            bail!("block {} does not extend the local chain", height);
        }

        let mut state = BTreeMap::new();
        for key in block.touched_keys() {
            let value = self.store.get(&key).await?;
            state.insert(key, value);
        }
        let before = state.clone();
        block.execute(&mut state);

        let mut batch = WriteBatch::new();
        let mut undo = Vec::new();
        let mut changes = Vec::new();
        for (key, after) in state {
            let prior = before.get(&key).cloned().flatten();
            if prior == after {
                continue;
            }
            match &after {
                Some(value) => batch.put(key.clone(), value.clone()),
                None => batch.delete(key.clone()),
            };
            undo.push((key.clone(), prior.clone()));
            changes.push((key, prior, after));
        }
        batch
            .put(chain::undo_key(height), to_cbor(&undo)?)
            .put(chain::hash_key(height), block.hash().to_vec())
            .put(chain::body_key(height), to_cbor(block)?)
            .set_meta(META_HEIGHT, height_bytes(height));
        self.store.write(batch).await?;
        self.index_block(block).await?;

        if self.checksum.schedule().crosses_migration(parent, height) {
            tracing::info!(node = %self.name, height, "checksum rule changed, rebuilding");
            self.rebuild_checksum(height).await?;
        } else {
            for (key, prior, after) in &changes {
                if let Some(prior) = prior {
                    self.checksum.add_or_remove(key, prior, height, false)?;
                }
                if let Some(after) = after {
                    self.checksum.add_or_remove(key, after, height, true)?;
                }
            }
        }

        self.update(|s| s.height = height);
        let period = self.config.snapshot_period;
        if period > 0 && height % period == 0 {
            self.take_snapshot(height).await?;
        }
        tracing::trace!(node = %self.name, height, changes = changes.len(), "applied block");
        Ok(())
    }

    async fn index_block(&self, block: &Block) -> anyhow::Result<()> {
        let Some(index) = &self.tx_index else {
            return Ok(());
        };
        let mut batch = WriteBatch::new();
        for i in 0..block.txs.len() {
            if let Some(hash) = block.tx_hash(i) {
                let mut location = height_bytes(block.height);
                location.extend_from_slice(&(i as u32).to_be_bytes());
                batch.put(chain::tx_key(&hash), location);
            }
        }
        index.write(batch).await?;
        Ok(())
    }

    async fn take_snapshot(&self, height: BlockHeight) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        for prefix in self.registry.state_prefixes() {
            self.snapshot.delete_prefix(&prefix).await?;
            for entry in self.store.scan_prefix(&prefix, SNAPSHOT_BATCH_SIZE).await? {
                batch.put(entry.key, entry.value);
            }
        }
        batch.set_meta(META_SNAPSHOT, height_bytes(height));
        let entries = batch.len();
        self.snapshot.write(batch).await?;
        self.update(|s| s.snapshot_height = height);
        tracing::debug!(node = %self.name, height, entries, "took snapshot");
        Ok(())
    }

    fn record_progress(&self, prefix: &KeyPrefix, last_key: Option<Bytes>, completed: bool) {
        let mut progress = lock(&self.progress);
        match progress.iter_mut().find(|p| &p.prefix == prefix) {
            Some(existing) => {
                if last_key.is_some() {
                    existing.last_received_key = last_key;
                }
                existing.completed = completed;
            }
            None => progress.push(PrefixProgress {
                prefix: prefix.clone(),
                last_received_key: last_key,
                completed,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Serving
    // ─────────────────────────────────────────────────────────────────────

    async fn serve(&self, request: Message) -> anyhow::Result<Message> {
        let response = match request {
            Message::GetTip => {
                let status = self.status();
                Message::Tip {
                    height: status.height,
                    snapshot_height: status.snapshot_height,
                }
            }
            Message::GetHeaders { from, to } => {
                let to = to.min(from.saturating_add(HEADER_BATCH - 1));
                let mut headers = Vec::new();
                for height in from..=to {
                    match self.store.get(&chain::hash_key(height)).await? {
                        Some(hash) => headers.push((height, hash)),
                        None => break,
                    }
                }
                Message::Headers { headers }
            }
            Message::GetBlocks { from, to } => {
                let to = to.min(from.saturating_add(self.config.block_batch.saturating_sub(1)));
                let mut blocks = Vec::new();
                for height in from..=to {
                    match self.store.get(&chain::body_key(height)).await? {
                        Some(body) => blocks.push(from_cbor(&body)?),
                        None => break,
                    }
                }
                Message::Blocks { blocks }
            }
            Message::GetSnapshotChunk {
                snapshot_height,
                prefix,
                start_after,
            } => {
                let current = self.status().snapshot_height;
                if current != snapshot_height {
                    Message::SnapshotChunk {
                        snapshot_height: current,
                        entries: Vec::new(),
                        is_full: false,
                    }
                } else {
                    let prefix = KeyPrefix::new(prefix)?;
                    let chunk = self
                        .snapshot
                        .iterate_prefix(
                            &prefix,
                            start_after.as_deref(),
                            self.config.snapshot_chunk_bytes,
                        )
                        .await?;
                    Message::SnapshotChunk {
                        snapshot_height,
                        is_full: chunk.is_full,
                        entries: chunk.entries.into_iter().map(|e| (e.key, e.value)).collect(),
                    }
                }
            }
            other => bail!("not a request: {:?}", other),
        };
        Ok(response)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Syncing
    // ─────────────────────────────────────────────────────────────────────

    async fn sync_from_peer(&self, req: &mut Requester, peer: &str) -> anyhow::Result<()> {
        let (tip, snapshot_height) = match req.call(Message::GetTip).await? {
            Message::Tip {
                height,
                snapshot_height,
            } => (height, snapshot_height),
            other => bail!("expected tip, got {:?}", other),
        };
        if self.config.block_producer {
            return Ok(());
        }
        let Ok(_syncing) = self.syncing.try_lock() else {
            tracing::debug!(node = %self.name, peer, "already syncing from another peer");
            return Ok(());
        };
        tracing::info!(node = %self.name, peer, tip, snapshot_height, "syncing from peer");

        let status = self.status();
        if self.config.sync_mode == SyncMode::HyperSync
            && status.height == 0
            && snapshot_height > 0
            && snapshot_height <= tip
        {
            self.hypersync(req, snapshot_height).await?;
        }
        if self.config.archival && self.status().bodies_missing {
            self.fetch_bodies(req).await?;
        }

        loop {
            let height = self.status().height;
            if height >= tip {
                break;
            }
            let to = tip.min(height + self.config.block_batch);
            let blocks = match req
                .call(Message::GetBlocks {
                    from: height + 1,
                    to,
                })
                .await?
            {
                Message::Blocks { blocks } => blocks,
                other => bail!("expected blocks, got {:?}", other),
            };
            if blocks.is_empty() {
                bail!("peer {} has no blocks after {}", peer, height);
            }
            for block in &blocks {
                self.apply_block(block).await?;
            }
        }

        self.update(|s| s.fully_current = true);
        tracing::info!(node = %self.name, height = self.status().height, "fully synced");
        Ok(())
    }

    async fn hypersync(
        &self,
        req: &mut Requester,
        snapshot_height: BlockHeight,
    ) -> anyhow::Result<()> {
        tracing::info!(node = %self.name, snapshot_height, "starting hypersync");
        let mut batch = WriteBatch::new();
        batch.set_meta(META_HYPERSYNC, height_bytes(snapshot_height));
        self.store.write(batch).await?;

        for prefix in self.registry.state_prefixes() {
            let mut cursor: Option<Bytes> = None;
            loop {
                let request = Message::GetSnapshotChunk {
                    snapshot_height,
                    prefix: Bytes::copy_from_slice(prefix.as_bytes()),
                    start_after: cursor.clone(),
                };
                let (entries, is_full) = match req.call(request).await? {
                    Message::SnapshotChunk {
                        snapshot_height: served,
                        entries,
                        is_full,
                    } if served == snapshot_height => (entries, is_full),
                    Message::SnapshotChunk {
                        snapshot_height: served,
                        ..
                    } => bail!("peer moved snapshot from {} to {}", snapshot_height, served),
                    other => bail!("expected snapshot chunk, got {:?}", other),
                };

                let mut batch = WriteBatch::new();
                for (key, value) in &entries {
                    if !prefix.matches(key) {
                        bail!("peer sent key {} outside {}", hex::encode(key), prefix);
                    }
                    batch.put(key.clone(), value.clone());
                }
                self.store.write(batch).await?;

                let last = entries.last().map(|(key, _)| key.clone());
                self.record_progress(&prefix, last.clone(), false);
                match last {
                    Some(key) if is_full => cursor = Some(key),
                    _ => break,
                }
            }
            self.record_progress(&prefix, None, true);
            tracing::debug!(node = %self.name, prefix = %prefix, "prefix downloaded");
        }

        let mut next = 1;
        while next <= snapshot_height {
            let to = snapshot_height.min(next + HEADER_BATCH - 1);
            let headers = match req.call(Message::GetHeaders { from: next, to }).await? {
                Message::Headers { headers } => headers,
                other => bail!("expected headers, got {:?}", other),
            };
            if headers.is_empty() {
                bail!("peer has no header at {}", next);
            }
            let mut batch = WriteBatch::new();
            for (height, hash) in headers {
                if height != next || hash.len() != 32 {
                    bail!("bad header at {}", next);
                }
                batch.put(chain::hash_key(height), hash);
                next += 1;
            }
            self.store.write(batch).await?;
        }

        let mut batch = WriteBatch::new();
        batch
            .set_meta(META_HEIGHT, height_bytes(snapshot_height))
            .set_meta(META_BODIES_MISSING, height_bytes(snapshot_height))
            .set_meta(META_HYPERSYNC, Vec::<u8>::new());
        self.store.write(batch).await?;
        self.update(|s| {
            s.height = snapshot_height;
            s.bodies_missing = true;
        });
        self.rebuild_checksum(snapshot_height).await?;
        tracing::info!(node = %self.name, snapshot_height, "hypersync complete");
        Ok(())
    }

    async fn fetch_bodies(&self, req: &mut Requester) -> anyhow::Result<()> {
        let through = decode_height(self.store.get_meta(META_BODIES_MISSING).await?);
        let mut next = 1;
        while next <= through {
            let to = through.min(next + self.config.block_batch.saturating_sub(1));
            let blocks = match req.call(Message::GetBlocks { from: next, to }).await? {
                Message::Blocks { blocks } => blocks,
                other => bail!("expected blocks, got {:?}", other),
            };
            if blocks.is_empty() {
                bail!("peer has no block body at {}", next);
            }
            let mut batch = WriteBatch::new();
            for block in &blocks {
                if block.height != next || block.hash() != self.hash_at(next).await? {
                    bail!("block body {} does not match its header", next);
                }
                batch.put(chain::body_key(next), to_cbor(block)?);
                self.index_block(block).await?;
                next += 1;
            }
            self.store.write(batch).await?;
        }

        let mut batch = WriteBatch::new();
        batch.set_meta(META_BODIES_MISSING, Vec::<u8>::new());
        self.store.write(batch).await?;
        self.update(|s| s.bodies_missing = false);
        tracing::info!(node = %self.name, through, "historical blocks stored");
        Ok(())
    }
}

async fn run_session(
    shared: Arc<Shared>,
    conn: PeerConnection,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(16);
    let (resp_tx, resp_rx) = mpsc::channel::<Message>(16);

    let write_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::debug!(error = %e, "peer write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let sync_task = {
        let shared = Arc::clone(&shared);
        let peer = peer.clone();
        let mut requester = Requester {
            out: out_tx.clone(),
            responses: resp_rx,
        };
        tokio::spawn(async move {
            if let Err(e) = shared.sync_from_peer(&mut requester, &peer).await {
                tracing::debug!(node = %shared.name, peer = %peer, error = %e, "sync stopped");
            }
        })
    };

    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(message)) if message.is_request() => match shared.serve(message).await {
                Ok(response) => {
                    if out_tx.send(response).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        node = %shared.name,
                        peer = %peer,
                        error = %e,
                        "failed to serve request"
                    );
                    break;
                }
            },
            Ok(Some(message)) => {
                // The sync task may already be done with this peer.
                let _ = resp_tx.send(message).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(node = %shared.name, peer = %peer, error = %e, "peer read failed");
                break;
            }
        }
    }

    drop(resp_tx);
    drop(out_tx);
    let _ = sync_task.await;
    let _ = write_task.await;
    shared.peers.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(node = %shared.name, peer = %peer, "peer session closed");
}

/// A simulated ledger node backed by SQLite stores in its data directory.
pub struct SimNode {
    shared: Arc<Shared>,
    sessions: Mutex<JoinSet<()>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl SimNode {
    /// Open (or create) a node's stores and persist its config.
    pub fn open(config: SimNodeConfig) -> anyhow::Result<Self> {
        config.save()?;
        let dir = config.data_dir.clone();
        let store = SqliteKvStore::open(dir.join("chain.db"))?;
        let snapshot = SqliteKvStore::open(dir.join("snapshot.db"))?;
        let tx_index = if config.tx_index {
            Some(Arc::new(SqliteKvStore::open(dir.join("txindex.db"))?))
        } else {
            None
        };

        let shared = Shared {
            name: config.endpoint(),
            chain: ChainSpec::new(config.chain_seed),
            registry: chain::registry()?,
            store: Arc::new(store),
            snapshot,
            tx_index,
            checksum: ChecksumAccumulator::new(chain::schedule()),
            status: Mutex::new(Status::default()),
            progress: Mutex::new(Vec::new()),
            apply: tokio::sync::Mutex::new(()),
            syncing: tokio::sync::Mutex::new(()),
            peers: AtomicUsize::new(0),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            sessions: Mutex::new(JoinSet::new()),
            shutdown: Mutex::new(None),
        })
    }

    /// Reopen a node from the config saved in `data_dir`.
    pub fn reopen(data_dir: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        Self::open(SimNodeConfig::load(data_dir)?)
    }

    pub fn config(&self) -> &SimNodeConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &PrefixRegistry {
        &self.shared.registry
    }

    /// Connected peer sessions.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.load(Ordering::SeqCst)
    }
}

impl PeerEndpoint for SimNode {
    fn endpoint_name(&self) -> String {
        self.shared.name.clone()
    }

    fn is_reachable(&self) -> bool {
        self.shared.status().running
    }

    fn attach_peer(
        &self,
        conn: PeerConnection,
        direction: LinkDirection,
        peer_name: &str,
    ) -> syncprobe_sync::Result<()> {
        let name = &self.shared.name;
        let shutdown = lock(&self.shutdown)
            .as_ref()
            .map(watch::Sender::subscribe)
            .ok_or_else(|| SyncError::node(name, "not running"))?;
        if self.peer_count() >= self.shared.config.max_peers {
            return Err(SyncError::node(name, "peer limit reached"));
        }
        let handle = Handle::try_current().map_err(|e| SyncError::Runtime(e.to_string()))?;

        self.shared.peers.fetch_add(1, Ordering::SeqCst);
        lock(&self.sessions).spawn_on(
            run_session(
                Arc::clone(&self.shared),
                conn,
                peer_name.to_string(),
                shutdown,
            ),
            &handle,
        );
        tracing::info!(node = %name, peer = peer_name, ?direction, "peer attached");
        Ok(())
    }
}

#[async_trait]
impl Node for SimNode {
    type Store = SqliteKvStore;

    fn is_running(&self) -> bool {
        self.shared.status().running
    }

    async fn start(&self) -> syncprobe_sync::Result<()> {
        let name = self.shared.name.clone();
        if self.is_running() {
            return Err(SyncError::node(name, "already running"));
        }
        self.shared
            .load()
            .await
            .map_err(|e| node_error(&name, e))?;
        if self.shared.config.block_producer {
            self.shared
                .produce()
                .await
                .map_err(|e| node_error(&name, e))?;
        }

        let (tx, _) = watch::channel(false);
        *lock(&self.shutdown) = Some(tx);
        self.shared.update(|s| s.running = true);
        tracing::info!(node = %name, "started");
        Ok(())
    }

    async fn stop(&self) -> syncprobe_sync::Result<()> {
        if !self.is_running() {
            return Err(SyncError::node(&self.shared.name, "not running"));
        }
        self.shared.update(|s| {
            s.running = false;
            s.fully_current = false;
        });

        let shutdown = lock(&self.shutdown).take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        let mut sessions = std::mem::take(&mut *lock(&self.sessions));
        while sessions.join_next().await.is_some() {}

        if let Err(e) = self.shared.checksum.wait().await {
            tracing::warn!(node = %self.shared.name, error = %e, "checksum failed during shutdown");
        }
        tracing::info!(node = %self.shared.name, "stopped");
        Ok(())
    }

    fn sync_status(&self) -> SyncStatus {
        let status = self.shared.status();
        let complete = status.fully_current && !status.bodies_missing;
        SyncStatus {
            height: status.height,
            fully_current: status.fully_current,
            fully_stored: complete,
            tx_index_synced: self.shared.config.tx_index && complete,
        }
    }

    async fn wait_for_background_idle(&self) -> syncprobe_sync::Result<()> {
        self.shared.checksum.wait().await?;
        Ok(())
    }

    async fn snapshot_checksum(&self) -> syncprobe_sync::Result<Option<Vec<u8>>> {
        self.shared.checksum.wait().await?;
        Ok(Some(self.shared.checksum.to_bytes()?))
    }

    fn chain_store(&self) -> Arc<SqliteKvStore> {
        Arc::clone(&self.shared.store)
    }

    fn tx_index_store(&self) -> Option<Arc<SqliteKvStore>> {
        self.shared.tx_index.clone()
    }

    fn hypersync_progress(&self) -> Vec<PrefixProgress> {
        lock(&self.shared.progress).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::init_tracing;

    fn producer(dir: &std::path::Path, height: BlockHeight) -> SimNode {
        SimNode::open(
            SimNodeConfig::new("producer", dir)
                .with_block_producer(true)
                .with_max_sync_height(height)
                .with_snapshot_period(20),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_producer_builds_chain_and_snapshot() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let node = producer(dir.path(), 45);
        node.start().await.unwrap();

        let status = node.sync_status();
        assert_eq!(status.height, 45);
        assert!(status.fully_current && status.fully_stored);
        assert_eq!(node.shared.status().snapshot_height, 40);

        let tip = node.shared.serve(Message::GetTip).await.unwrap();
        assert_eq!(
            tip,
            Message::Tip {
                height: 45,
                snapshot_height: 40
            }
        );
    }

    #[tokio::test]
    async fn test_lifecycle_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let node = producer(dir.path(), 3);
        assert!(node.stop().await.is_err());
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        node.stop().await.unwrap();
        assert!(!node.is_reachable());
    }

    #[tokio::test]
    async fn test_restart_recovers_height_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let node = producer(dir.path(), 30);
        node.start().await.unwrap();
        let checksum = node.snapshot_checksum().await.unwrap();
        node.stop().await.unwrap();

        let reopened = SimNode::reopen(dir.path()).unwrap();
        reopened.start().await.unwrap();
        assert_eq!(reopened.sync_status().height, 30);
        assert_eq!(reopened.snapshot_checksum().await.unwrap(), checksum);
    }

    #[tokio::test]
    async fn test_incremental_checksum_matches_rebuild_across_migration() {
        let dir = tempfile::tempdir().unwrap();
        let node = producer(dir.path(), chain::MIGRATION_HEIGHT + 20);
        node.start().await.unwrap();
        let incremental = node.snapshot_checksum().await.unwrap();

        node.shared
            .rebuild_checksum(chain::MIGRATION_HEIGHT + 20)
            .await
            .unwrap();
        assert_eq!(node.snapshot_checksum().await.unwrap(), incremental);
    }

    #[tokio::test]
    async fn test_serves_snapshot_chunks_in_pages() {
        let dir = tempfile::tempdir().unwrap();
        let node = SimNode::open(
            SimNodeConfig::new("producer", dir.path())
                .with_block_producer(true)
                .with_max_sync_height(60)
                .with_snapshot_period(50)
                .with_snapshot_chunk_bytes(64),
        )
        .unwrap();
        node.start().await.unwrap();

        let request = Message::GetSnapshotChunk {
            snapshot_height: 50,
            prefix: Bytes::from_static(&[chain::POSTS]),
            start_after: None,
        };
        match node.shared.serve(request).await.unwrap() {
            Message::SnapshotChunk {
                snapshot_height,
                entries,
                is_full,
            } => {
                assert_eq!(snapshot_height, 50);
                assert!(!entries.is_empty());
                assert!(is_full);
            }
            other => panic!("unexpected response {:?}", other),
        }

        let stale = Message::GetSnapshotChunk {
            snapshot_height: 10,
            prefix: Bytes::from_static(&[chain::POSTS]),
            start_after: None,
        };
        assert!(matches!(
            node.shared.serve(stale).await.unwrap(),
            Message::SnapshotChunk { snapshot_height: 50, .. }
        ));
    }
}
