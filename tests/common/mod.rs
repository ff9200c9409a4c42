//! Shared test utilities for the integration suite.
//!
//! This module provides:
//! - An in-memory mesh of transports with partition/heal controls
//! - Frame injection for redelivery tests
//! - Polling helpers for eventual-consistency assertions

#![allow(dead_code)] // Each integration test binary uses a subset.

use bytes::Bytes;
use futures::future::BoxFuture;
use lattice_mesh::{
    Connection, ConnectionMap, GSet, InboundFrame, MeshConfig, MeshHandle, MeshManager, PeerId,
    SendError, Tag, Transport, WireVersion,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// The metadata type used across the suite: the two-element semilattice
/// `Set<u64>` with union as join.
pub type TestSet = GSet<u64>;
pub type TestManager = MeshManager<TestSet, MemoryTransport>;
pub type TestHandle = MeshHandle<TestSet, MemoryTransport>;

/// The suite binds every manager under this tag.
pub const TEST_TAG: u16 = 1;

struct Link {
    conn: Connection,
    remote: Weak<MemoryTransport>,
}

/// One node's view of the in-memory mesh.
pub struct MemoryTransport {
    local: PeerId,
    conns: watch::Sender<ConnectionMap>,
    handlers: Mutex<HashMap<u16, mpsc::UnboundedSender<InboundFrame>>>,
    links: Mutex<HashMap<PeerId, Link>>,
    send_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryTransport {
    fn new(local: PeerId) -> Arc<Self> {
        let (conns, _) = watch::channel(ConnectionMap::new());
        Arc::new(Self {
            local,
            conns,
            handlers: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            send_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Hold every send open for `delay`, making concurrency observable.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Highest number of sends this transport ever had in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Deliver a raw frame to this node, as if `from` had sent it.
    /// Used to inject duplicates and hand-crafted messages.
    pub fn inject(&self, tag: u16, from: &str, payload: Bytes) {
        if let Some(handler) = self.handlers.lock().unwrap().get(&tag) {
            let _ = handler.send(InboundFrame {
                from: PeerId::from(from),
                payload,
            });
        }
    }
}

impl Transport for MemoryTransport {
    fn wire_version(&self) -> WireVersion {
        WireVersion::V1
    }

    fn watch_connections(&self) -> watch::Receiver<ConnectionMap> {
        self.conns.subscribe()
    }

    fn register(&self, tag: Tag) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers.lock().unwrap().insert(tag.0, tx);
        rx
    }

    fn send(
        &self,
        connection: &Connection,
        tag: Tag,
        frame: Bytes,
    ) -> BoxFuture<'_, Result<(), SendError>> {
        let connection = connection.clone();
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = *self.send_delay.lock().unwrap();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            let result = self.deliver(&connection, tag, frame);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

impl MemoryTransport {
    fn deliver(
        &self,
        connection: &Connection,
        tag: Tag,
        frame: Bytes,
    ) -> Result<(), SendError> {
        if connection.is_closed() {
            return Err(SendError("connection closed".into()));
        }
        let links = self.links.lock().unwrap();
        let link = links
            .get(connection.peer())
            .ok_or_else(|| SendError("no link to peer".into()))?;
        if link.conn.id() != connection.id() {
            return Err(SendError("stale connection handle".into()));
        }
        let Some(remote) = link.remote.upgrade() else {
            return Err(SendError("remote transport gone".into()));
        };
        // A bound tag delivers to its handler; an unbound tag swallows the
        // frame, which models a peer that never answers.
        if let Some(handler) = remote.handlers.lock().unwrap().get(&tag.0) {
            let _ = handler.send(InboundFrame {
                from: self.local.clone(),
                payload: frame,
            });
        }
        Ok(())
    }
}

/// A set of in-memory transports wired together on demand.
pub struct MemoryMesh {
    nodes: Mutex<HashMap<PeerId, Arc<MemoryTransport>>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a transport endpoint for `name`.
    pub fn add_node(&self, name: &str) -> Arc<MemoryTransport> {
        let peer = PeerId::from(name);
        let transport = MemoryTransport::new(peer.clone());
        self.nodes
            .lock()
            .unwrap()
            .insert(peer, Arc::clone(&transport));
        transport
    }

    fn node(&self, name: &str) -> Arc<MemoryTransport> {
        self.nodes
            .lock()
            .unwrap()
            .get(&PeerId::from(name))
            .cloned()
            .expect("unknown node")
    }

    /// Bring up a bidirectional connection between two nodes.
    ///
    /// Each call produces fresh connection handles, so reconnecting after
    /// a partition looks like a brand-new connection to both sides.
    pub fn connect(&self, a: &str, b: &str) {
        let ta = self.node(a);
        let tb = self.node(b);

        let a_to_b = Connection::new(PeerId::from(b));
        let b_to_a = Connection::new(PeerId::from(a));

        ta.links.lock().unwrap().insert(
            PeerId::from(b),
            Link {
                conn: a_to_b.clone(),
                remote: Arc::downgrade(&tb),
            },
        );
        tb.links.lock().unwrap().insert(
            PeerId::from(a),
            Link {
                conn: b_to_a.clone(),
                remote: Arc::downgrade(&ta),
            },
        );

        ta.conns.send_modify(|map| {
            map.insert(PeerId::from(b), a_to_b);
        });
        tb.conns.send_modify(|map| {
            map.insert(PeerId::from(a), b_to_a);
        });
    }

    /// Tear down the connection between two nodes, firing both drains.
    pub fn disconnect(&self, a: &str, b: &str) {
        let ta = self.node(a);
        let tb = self.node(b);

        if let Some(link) = ta.links.lock().unwrap().remove(&PeerId::from(b)) {
            link.conn.close();
        }
        if let Some(link) = tb.links.lock().unwrap().remove(&PeerId::from(a)) {
            link.conn.close();
        }
        ta.conns.send_modify(|map| {
            map.remove(&PeerId::from(b));
        });
        tb.conns.send_modify(|map| {
            map.remove(&PeerId::from(a));
        });
    }

    /// Fully interconnect every node added so far.
    pub fn connect_all(&self) {
        let names: Vec<String> = self
            .nodes
            .lock()
            .unwrap()
            .keys()
            .map(|p| p.as_str().to_string())
            .collect();
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                self.connect(a, b);
            }
        }
    }
}

/// Start a manager on `transport` with an empty set.
pub fn start_manager(transport: Arc<MemoryTransport>) -> TestManager {
    MeshManager::new(transport, MeshConfig::for_testing(TEST_TAG), TestSet::new())
}

/// Build a `GSet<u64>` from a slice.
pub fn set(items: &[u64]) -> TestSet {
    items.iter().copied().collect()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Install a test subscriber for log output. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}
