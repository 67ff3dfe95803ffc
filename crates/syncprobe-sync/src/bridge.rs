//! In-process network links between two nodes.
//!
//! A [`NetworkLink`] hands each endpoint one half of an in-memory duplex
//! stream and relays bytes between them. Aborting the relay tasks closes both
//! streams, which the nodes observe as a dropped peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::node::{LinkDirection, PeerEndpoint};

/// Default capacity of each duplex pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Byte counters for a link.
#[derive(Debug, Default)]
pub struct LinkStats {
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
}

impl LinkStats {
    /// Bytes relayed from the first endpoint to the second.
    pub fn a_to_b(&self) -> u64 {
        self.a_to_b.load(Ordering::Relaxed)
    }

    /// Bytes relayed from the second endpoint to the first.
    pub fn b_to_a(&self) -> u64 {
        self.b_to_a.load(Ordering::Relaxed)
    }
}

enum LinkState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Severed,
}

/// A bidirectional connection between two endpoints.
///
/// Lifecycle: `Idle -> Running -> Severed`. A severed link cannot be
/// restarted; reconnecting two nodes means creating a new link.
pub struct NetworkLink {
    a: Arc<dyn PeerEndpoint>,
    b: Arc<dyn PeerEndpoint>,
    capacity: usize,
    state: Mutex<LinkState>,
    stats: Arc<LinkStats>,
}

impl NetworkLink {
    /// Create an idle link between `a` (the dialing side) and `b`.
    pub fn new(a: Arc<dyn PeerEndpoint>, b: Arc<dyn PeerEndpoint>) -> Self {
        Self {
            a,
            b,
            capacity: DEFAULT_PIPE_CAPACITY,
            state: Mutex::new(LinkState::Idle),
            stats: Arc::new(LinkStats::default()),
        }
    }

    /// Set the duplex pipe capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Human-readable `a <-> b` label.
    pub fn name(&self) -> String {
        format!("{} <-> {}", self.a.endpoint_name(), self.b.endpoint_name())
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock_state(), Ok(state) if matches!(*state, LinkState::Running(_)))
    }

    pub fn is_severed(&self) -> bool {
        matches!(self.lock_state(), Ok(state) if matches!(*state, LinkState::Severed))
    }

    /// Connect the endpoints and begin relaying traffic.
    ///
    /// Fails if either endpoint is unreachable or the link was already
    /// started. A failed start severs the link.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        match *state {
            LinkState::Idle => {}
            LinkState::Running(_) => return Err(SyncError::LinkAlreadyStarted(self.name())),
            LinkState::Severed => return Err(SyncError::LinkSevered(self.name())),
        }

        let handle = Handle::try_current().map_err(|e| SyncError::Runtime(e.to_string()))?;

        for endpoint in [&self.a, &self.b] {
            if !endpoint.is_reachable() {
                return Err(SyncError::EndpointUnreachable(endpoint.endpoint_name()));
            }
        }

        let a_name = self.a.endpoint_name();
        let b_name = self.b.endpoint_name();
        let (a_node, a_relay) = tokio::io::duplex(self.capacity);
        let (b_node, b_relay) = tokio::io::duplex(self.capacity);

        let attached = self
            .a
            .attach_peer(a_node, LinkDirection::Outbound, &b_name)
            .and_then(|()| self.b.attach_peer(b_node, LinkDirection::Inbound, &a_name));
        if let Err(e) = attached {
            *state = LinkState::Severed;
            return Err(e);
        }

        let (a_read, a_write) = tokio::io::split(a_relay);
        let (b_read, b_write) = tokio::io::split(b_relay);

        let to_b = handle.spawn(relay(
            a_read,
            b_write,
            Arc::clone(&self.stats),
            Direction::AToB,
            format!("{} -> {}", a_name, b_name),
        ));
        let to_a = handle.spawn(relay(
            b_read,
            a_write,
            Arc::clone(&self.stats),
            Direction::BToA,
            format!("{} -> {}", b_name, a_name),
        ));

        *state = LinkState::Running(vec![to_b, to_a]);
        tracing::info!(link = %self.name(), "link started");
        Ok(())
    }

    /// Sever the link. Irreversible.
    ///
    /// Disconnecting an already severed link is an error.
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        match std::mem::replace(&mut *state, LinkState::Severed) {
            LinkState::Running(tasks) => {
                for task in tasks {
                    task.abort();
                }
            }
            LinkState::Idle => {}
            LinkState::Severed => return Err(SyncError::LinkSevered(self.name())),
        }
        tracing::info!(
            link = %self.name(),
            a_to_b = self.stats.a_to_b(),
            b_to_a = self.stats.b_to_a(),
            "link disconnected"
        );
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LinkState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Runtime("link state lock poisoned".into()))
    }
}

impl Drop for NetworkLink {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let LinkState::Running(tasks) = std::mem::replace(&mut *state, LinkState::Severed) {
                for task in tasks {
                    task.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for NetworkLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkLink")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("severed", &self.is_severed())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

const RELAY_BUFFER: usize = 16 * 1024;

async fn relay<R, W>(mut from: R, mut to: W, stats: Arc<LinkStats>, dir: Direction, route: String)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = match dir {
        Direction::AToB => &stats.a_to_b,
        Direction::BToA => &stats.b_to_a,
    };
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%route, error = %e, "relay read failed");
                break;
            }
        };
        if let Err(e) = to.write_all(&buf[..n]).await {
            tracing::debug!(%route, error = %e, "relay write failed");
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    // Propagate EOF so the far side sees the peer go away.
    let _ = to.shutdown().await;
    tracing::trace!(%route, "relay finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PeerConnection;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    /// Endpoint that hands attached connections to the test.
    struct Probe {
        name: &'static str,
        reachable: AtomicBool,
        conns: mpsc::UnboundedSender<(PeerConnection, LinkDirection)>,
    }

    fn probe(
        name: &'static str,
    ) -> (Arc<Probe>, mpsc::UnboundedReceiver<(PeerConnection, LinkDirection)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(Probe {
            name,
            reachable: AtomicBool::new(true),
            conns: tx,
        });
        (probe, rx)
    }

    impl PeerEndpoint for Probe {
        fn endpoint_name(&self) -> String {
            self.name.to_string()
        }

        fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        fn attach_peer(
            &self,
            conn: PeerConnection,
            direction: LinkDirection,
            _peer_name: &str,
        ) -> Result<()> {
            self.conns
                .send((conn, direction))
                .map_err(|_| SyncError::node(self.name, "probe closed"))
        }
    }

    #[tokio::test]
    async fn test_link_relays_both_ways() {
        let (a, mut a_rx) = probe("a");
        let (b, mut b_rx) = probe("b");
        let link = NetworkLink::new(a, b);
        link.start().unwrap();

        let (mut a_conn, a_dir) = a_rx.recv().await.unwrap();
        let (mut b_conn, b_dir) = b_rx.recv().await.unwrap();
        assert_eq!(a_dir, LinkDirection::Outbound);
        assert_eq!(b_dir, LinkDirection::Inbound);

        a_conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_conn.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        a_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        assert_eq!(link.stats().a_to_b(), 4);
        assert_eq!(link.stats().b_to_a(), 5);
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams() {
        let (a, mut a_rx) = probe("a");
        let (b, mut b_rx) = probe("b");
        let link = NetworkLink::new(a, b);
        link.start().unwrap();
        let (mut a_conn, _) = a_rx.recv().await.unwrap();
        let (mut b_conn, _) = b_rx.recv().await.unwrap();

        link.disconnect().unwrap();
        assert!(link.is_severed());

        let mut buf = [0u8; 1];
        assert_eq!(a_conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(b_conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_link_lifecycle_errors() {
        let (a, _a_rx) = probe("a");
        let (b, _b_rx) = probe("b");
        let link = NetworkLink::new(a, b);
        link.start().unwrap();
        assert!(matches!(link.start(), Err(SyncError::LinkAlreadyStarted(_))));

        link.disconnect().unwrap();
        assert!(matches!(link.disconnect(), Err(SyncError::LinkSevered(_))));
        assert!(matches!(link.start(), Err(SyncError::LinkSevered(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let (a, _a_rx) = probe("a");
        let (b, _b_rx) = probe("b");
        b.reachable.store(false, Ordering::SeqCst);
        let link = NetworkLink::new(a, b);
        match link.start() {
            Err(SyncError::EndpointUnreachable(name)) => assert_eq!(name, "b"),
            other => panic!("expected unreachable endpoint, got {:?}", other),
        }
        assert!(!link.is_running());
    }

    #[test]
    fn test_start_requires_runtime() {
        let (a, _a_rx) = probe("a");
        let (b, _b_rx) = probe("b");
        let link = NetworkLink::new(a, b);
        assert!(matches!(link.start(), Err(SyncError::Runtime(_))));
    }
}
