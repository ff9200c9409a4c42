// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster transport abstraction.
//!
//! The replication core does not open sockets. It consumes a [`Transport`]
//! that provides framed tagged sends, a watchable connection map, and the
//! negotiated wire version. Peer discovery, connection establishment, and
//! frame integrity all live behind this trait.
//!
//! # Connection identity and leases
//!
//! Reconnects produce a *new* [`Connection`] for the same [`PeerId`], so
//! anything tracking connections must key by handle identity
//! ([`Connection::id`]), not by peer. A `Connection` clone is a keepalive
//! lease: while any clone exists the connection object stays valid, and
//! dropping the last clone permits teardown. The connection's
//! [`closed`](Connection::closed) token is its drain signal; waiters race
//! against it to abandon work when the link goes away.

use crate::config::Tag;
use crate::wire::WireVersion;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Opaque peer identifier supplied by the transport.
///
/// Equality-comparable and hashable; stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ConnectionInner {
    peer: PeerId,
    closed: CancellationToken,
}

/// A live connection handle.
///
/// Pointer-identified within its lifetime: two handles refer to the same
/// connection iff [`Connection::id`] matches. Cloning takes a keepalive
/// lease on the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a handle for a connection to `peer`.
    ///
    /// Called by transport implementations when a link comes up.
    pub fn new(peer: PeerId) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                peer,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// The peer on the far side of this connection.
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Identity token for this connection. Distinct reconnects to the same
    /// peer yield distinct ids.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// The connection's drain signal: fires once when the link is torn down.
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    /// True if the drain signal has fired.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Fire the drain signal. Called by transport implementations on
    /// connection loss.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The transport's current connection set, keyed by peer.
pub type ConnectionMap = HashMap<PeerId, Connection>;

/// A frame delivered to the manager's bound tag.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// The peer the frame arrived from.
    pub from: PeerId,
    /// The frame payload (opaque to the transport).
    pub payload: Bytes,
}

/// Error from a transport send.
///
/// The core treats all send failures as silent drops; peers recover via the
/// reconnect bootstrap.
#[derive(Debug, Clone)]
pub struct SendError(pub String);

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SendError {}

/// The cluster transport consumed by the replication core.
///
/// Implementations own discovery, connection lifecycle, and framing. The
/// in-memory mesh used by the integration tests implements this trait; a
/// production transport wraps real sockets.
pub trait Transport: Send + Sync + 'static {
    /// The wire version negotiated for this cluster.
    fn wire_version(&self) -> WireVersion;

    /// Watch the live connection map.
    ///
    /// The receiver observes every membership change; the current map is
    /// available immediately via `borrow`.
    fn watch_connections(&self) -> watch::Receiver<ConnectionMap>;

    /// Look up the live connection to `peer`, taking a keepalive lease on it.
    fn lookup(&self, peer: &PeerId) -> Option<Connection> {
        self.watch_connections().borrow().get(peer).cloned()
    }

    /// Bind `tag` and return the stream of frames addressed to it.
    ///
    /// Called once per tag by the component binding to it; a second call
    /// for the same tag replaces the previous binding.
    fn register(&self, tag: Tag) -> mpsc::UnboundedReceiver<InboundFrame>;

    /// Fire-and-forget framed send on `connection`.
    ///
    /// Resolves when the transport has accepted (or dropped) the frame.
    fn send(
        &self,
        connection: &Connection,
        tag: Tag,
        frame: Bytes,
    ) -> BoxFuture<'_, std::result::Result<(), SendError>>;
}
