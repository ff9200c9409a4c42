// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound message handling and the version synchronization engine.
//!
//! All five protocol messages land here. Metadata pushes are merged into
//! the store and recorded in the per-peer observed-version table. The two
//! checkpoint protocols are driven by correlating query/reply pairs:
//!
//! - **sync_from**: "after this returns, I have merged at least everything
//!   the named peer had applied when it answered my query." The caller asks
//!   the peer for its current version, then waits until that version has
//!   been observed locally.
//! - **sync_to**: "after this returns, the named peer has merged at least
//!   everything I had applied when I called." The caller sends its current
//!   version; the peer replies once it has observed it.
//!
//! Every blocking wait races the caller's interruptor, the relevant
//! connection's drain, and the manager shutdown drain. Waiter registrations
//! are guarded: the registering scope deregisters on unwind, so a cancelled
//! or failed operation leaves nothing behind.

use crate::error::{MeshError, Result};
use crate::lattice::Lattice;
use crate::manager::Core;
use crate::metrics;
use crate::transport::{InboundFrame, PeerId, Transport};
use crate::wire::{Message, WireEncode};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Snapshot of outstanding synchronization state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDiagnostics {
    /// Outstanding sync-from queries awaiting a version reply.
    pub sync_from_queries: usize,
    /// Outstanding sync-to queries awaiting acknowledgement.
    pub sync_to_queries: usize,
    /// Registered version waiters (both sync paths).
    pub version_waiters: usize,
}

/// `peer_latest_seen` and the version-waiter multimap, guarded together.
///
/// Critical sections here are short and never cross an await.
#[derive(Default)]
struct PeerVersions {
    latest_seen: HashMap<PeerId, u64>,
    waiters: HashMap<(PeerId, u64), Vec<(u64, oneshot::Sender<()>)>>,
    next_waiter_id: u64,
}

/// Shared state for the synchronization engine.
pub(crate) struct SyncState {
    peer_versions: Mutex<PeerVersions>,
    sync_from_waiters: DashMap<u64, oneshot::Sender<u64>>,
    sync_to_waiters: DashMap<u64, oneshot::Sender<()>>,
    next_sync_from_id: AtomicU64,
    next_sync_to_id: AtomicU64,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            peer_versions: Mutex::new(PeerVersions::default()),
            sync_from_waiters: DashMap::new(),
            sync_to_waiters: DashMap::new(),
            next_sync_from_id: AtomicU64::new(0),
            next_sync_to_id: AtomicU64::new(0),
        }
    }

    /// The highest change version observed in metadata messages from `peer`.
    pub(crate) fn latest_seen(&self, peer: &PeerId) -> Option<u64> {
        self.peer_versions
            .lock()
            .expect("peer-version mutex poisoned")
            .latest_seen
            .get(peer)
            .copied()
    }

    /// Record an observed change version from `peer` and wake every waiter
    /// whose threshold it satisfies.
    ///
    /// Observed versions only move forward; an out-of-order message with a
    /// lower version is harmless because waiters compare with `<=`.
    pub(crate) fn observe(&self, peer: &PeerId, change_version: u64) {
        let mut pv = self
            .peer_versions
            .lock()
            .expect("peer-version mutex poisoned");

        let entry = pv.latest_seen.entry(peer.clone()).or_insert(change_version);
        if change_version > *entry {
            *entry = change_version;
        }

        pv.waiters.retain(|(waiter_peer, threshold), slots| {
            if waiter_peer == peer && *threshold <= change_version {
                for (_, tx) in slots.drain(..) {
                    let _ = tx.send(());
                }
                false
            } else {
                true
            }
        });
    }

    /// Register a waiter for `peer` reaching `version`. The caller must
    /// hold the returned guard until it stops waiting.
    #[cfg(test)]
    fn register_waiter(
        &self,
        peer: &PeerId,
        version: u64,
    ) -> (VersionWaiterGuard<'_>, oneshot::Receiver<()>) {
        let mut pv = self
            .peer_versions
            .lock()
            .expect("peer-version mutex poisoned");
        let waiter_id = pv.next_waiter_id;
        pv.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        pv.waiters
            .entry((peer.clone(), version))
            .or_default()
            .push((waiter_id, tx));
        (
            VersionWaiterGuard {
                state: self,
                peer: peer.clone(),
                version,
                waiter_id,
            },
            rx,
        )
    }

    pub(crate) fn diagnostics(&self) -> SyncDiagnostics {
        let pv = self
            .peer_versions
            .lock()
            .expect("peer-version mutex poisoned");
        SyncDiagnostics {
            sync_from_queries: self.sync_from_waiters.len(),
            sync_to_queries: self.sync_to_waiters.len(),
            version_waiters: pv.waiters.values().map(Vec::len).sum(),
        }
    }
}

/// Deregisters a version waiter when the waiting scope unwinds.
struct VersionWaiterGuard<'a> {
    state: &'a SyncState,
    peer: PeerId,
    version: u64,
    waiter_id: u64,
}

impl Drop for VersionWaiterGuard<'_> {
    fn drop(&mut self) {
        let mut pv = self
            .state
            .peer_versions
            .lock()
            .expect("peer-version mutex poisoned");
        let key = (self.peer.clone(), self.version);
        if let Some(slots) = pv.waiters.get_mut(&key) {
            slots.retain(|(id, _)| *id != self.waiter_id);
            if !slots.is_empty() {
                return;
            }
        }
        pv.waiters.remove(&key);
    }
}

/// Deregisters an outstanding query when the issuing scope unwinds.
struct QueryGuard<'a, V> {
    map: &'a DashMap<u64, V>,
    query_id: u64,
}

impl<V> Drop for QueryGuard<'_, V> {
    fn drop(&mut self) {
        self.map.remove(&self.query_id);
    }
}

/// Wait until `peer`'s observed version reaches `version`.
///
/// Returns immediately if the version has already been observed. Otherwise
/// requires a live connection to `peer` and waits for a metadata message to
/// satisfy the threshold, racing the connection drain, the caller's
/// interruptor, and the manager shutdown drain.
pub(crate) async fn wait_for_version_from_peer<M, T>(
    core: &Core<M, T>,
    peer: &PeerId,
    version: u64,
    interrupt: &CancellationToken,
) -> Result<()>
where
    M: Lattice + WireEncode,
    T: Transport,
{
    // Check and register under one critical section: an observation landing
    // between the two would otherwise strand the waiter.
    let (guard, rx, conn) = {
        let mut pv = core
            .sync
            .peer_versions
            .lock()
            .expect("peer-version mutex poisoned");
        if version == 0 || pv.latest_seen.get(peer).copied().unwrap_or(0) >= version {
            return Ok(());
        }
        let conn = core
            .transport
            .lookup(peer)
            .ok_or_else(|| MeshError::sync_failed(peer))?;
        let waiter_id = pv.next_waiter_id;
        pv.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        pv.waiters
            .entry((peer.clone(), version))
            .or_default()
            .push((waiter_id, tx));
        (
            VersionWaiterGuard {
                state: &core.sync,
                peer: peer.clone(),
                version,
                waiter_id,
            },
            rx,
            conn,
        )
    };

    let result = tokio::select! {
        received = rx => match received {
            Ok(()) => Ok(()),
            Err(_) => Err(MeshError::ManagerGone),
        },
        _ = conn.closed().cancelled() => Err(MeshError::sync_failed(peer)),
        _ = interrupt.cancelled() => Err(MeshError::Interrupted),
        _ = core.shutdown.cancelled() => Err(MeshError::ManagerGone),
    };
    drop(guard);
    result
}

/// Caller side of the sync-from protocol.
pub(crate) async fn sync_from<M, T>(
    core: &Arc<Core<M, T>>,
    peer: &PeerId,
    interrupt: &CancellationToken,
) -> Result<()>
where
    M: Lattice + WireEncode,
    T: Transport,
{
    let conn = core
        .transport
        .lookup(peer)
        .ok_or_else(|| MeshError::sync_failed(peer))?;

    let query_id = core.sync.next_sync_from_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    core.sync.sync_from_waiters.insert(query_id, tx);
    let _guard = QueryGuard {
        map: &core.sync.sync_from_waiters,
        query_id,
    };
    debug!(peer_id = %peer, query_id, "Issuing sync-from query");

    core.dispatcher
        .send(&conn, &Message::<M>::SyncFromQuery { query_id }, interrupt)
        .await?;

    let peer_version = tokio::select! {
        received = rx => match received {
            Ok(version) => version,
            Err(_) => return Err(MeshError::ManagerGone),
        },
        _ = conn.closed().cancelled() => return Err(MeshError::sync_failed(peer)),
        _ = interrupt.cancelled() => return Err(MeshError::Interrupted),
        _ = core.shutdown.cancelled() => return Err(MeshError::ManagerGone),
    };
    trace!(peer_id = %peer, query_id, peer_version, "Sync-from reply received");

    wait_for_version_from_peer(core, peer, peer_version, interrupt).await
}

/// Caller side of the sync-to protocol.
pub(crate) async fn sync_to<M, T>(
    core: &Arc<Core<M, T>>,
    peer: &PeerId,
    interrupt: &CancellationToken,
) -> Result<()>
where
    M: Lattice + WireEncode,
    T: Transport,
{
    let conn = core
        .transport
        .lookup(peer)
        .ok_or_else(|| MeshError::sync_failed(peer))?;

    let local_version = core.store.version();
    let query_id = core.sync.next_sync_to_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    core.sync.sync_to_waiters.insert(query_id, tx);
    let _guard = QueryGuard {
        map: &core.sync.sync_to_waiters,
        query_id,
    };
    debug!(peer_id = %peer, query_id, local_version, "Issuing sync-to query");

    core.dispatcher
        .send(
            &conn,
            &Message::<M>::SyncToQuery {
                query_id,
                version: local_version,
            },
            interrupt,
        )
        .await?;

    tokio::select! {
        received = rx => match received {
            Ok(()) => Ok(()),
            Err(_) => Err(MeshError::ManagerGone),
        },
        _ = conn.closed().cancelled() => Err(MeshError::sync_failed(peer)),
        _ = interrupt.cancelled() => Err(MeshError::Interrupted),
        _ = core.shutdown.cancelled() => Err(MeshError::ManagerGone),
    }
}

/// The inbound dispatch loop: the manager's home task.
///
/// All authoritative state mutation driven by received messages happens on
/// this task or under the short peer-version mutex.
pub(crate) async fn run_inbound<M, T>(
    core: Arc<Core<M, T>>,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
) where
    M: Lattice + WireEncode,
    T: Transport,
{
    let wire_version = core.transport.wire_version();
    loop {
        let frame = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let InboundFrame { from, payload } = frame;
        let Some(message) = Message::<M>::decode(wire_version, payload.clone()) else {
            protocol_violation(&from, &payload);
        };
        metrics::record_inbound_message(message.kind());
        handle_message(&core, from, message);
    }
    trace!("Inbound dispatch loop stopped");
}

fn handle_message<M, T>(core: &Arc<Core<M, T>>, from: PeerId, message: Message<M>)
where
    M: Lattice + WireEncode,
    T: Transport,
{
    match message {
        Message::Metadata { delta, version } => {
            // Merge first, then publish the observed version: a waiter woken
            // by this version must already see the merged value.
            core.store.remote_join(delta);
            core.sync.observe(&from, version);
        }

        Message::SyncFromQuery { query_id } => {
            // The reply carries our version at the moment the query was
            // processed, not at send time.
            let version = core.store.version();
            let Some(conn) = core.transport.lookup(&from) else {
                trace!(peer_id = %from, query_id, "Sync-from querier already gone");
                return;
            };
            let core = Arc::clone(core);
            core.tasks.clone().spawn(async move {
                let _ = core
                    .dispatcher
                    .send(
                        &conn,
                        &Message::<M>::SyncFromReply { query_id, version },
                        &CancellationToken::new(),
                    )
                    .await;
            });
        }

        Message::SyncFromReply { query_id, version } => {
            match core.sync.sync_from_waiters.remove(&query_id) {
                Some((_, tx)) => {
                    let _ = tx.send(version);
                }
                None => {
                    // At most one reply per query is expected; a second hints
                    // at wire corruption upstream.
                    warn!(peer_id = %from, query_id, version,
                          "Duplicate or unknown sync-from reply; ignoring");
                    metrics::record_duplicate_reply("sync_from");
                }
            }
        }

        Message::SyncToQuery { query_id, version } => {
            let core = Arc::clone(core);
            core.tasks.clone().spawn(async move {
                // No caller interruptor here: the wait races only the
                // connection drain and the manager shutdown drain.
                let interrupt = CancellationToken::new();
                match wait_for_version_from_peer(&core, &from, version, &interrupt).await {
                    Ok(()) => {
                        let Some(conn) = core.transport.lookup(&from) else {
                            return;
                        };
                        let _ = core
                            .dispatcher
                            .send(&conn, &Message::<M>::SyncToReply { query_id }, &interrupt)
                            .await;
                    }
                    Err(_) => {
                        // Abandon the reply; the querying side observes its
                        // own connection drain and fails the operation.
                        trace!(peer_id = %from, query_id,
                               "Abandoning sync-to reply: connection or manager drained");
                    }
                }
            });
        }

        Message::SyncToReply { query_id } => {
            match core.sync.sync_to_waiters.remove(&query_id) {
                Some((_, tx)) => {
                    let _ = tx.send(());
                }
                None => {
                    trace!(peer_id = %from, query_id, "Unknown sync-to reply; dropping");
                    metrics::record_duplicate_reply("sync_to");
                }
            }
        }
    }
}

/// Garbled wire bytes are a fatal protocol violation: the transport is
/// trusted for framing and integrity, so there is nothing to recover.
fn protocol_violation(peer: &PeerId, payload: &Bytes) -> ! {
    error!(
        peer_id = %peer,
        len = payload.len(),
        first_byte = payload.first().copied(),
        "Undecodable mesh frame; aborting"
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    #[test]
    fn test_observe_records_maximum() {
        let state = SyncState::new();
        assert_eq!(state.latest_seen(&peer("a")), None);

        state.observe(&peer("a"), 3);
        assert_eq!(state.latest_seen(&peer("a")), Some(3));

        // Reordered delivery regresses nothing.
        state.observe(&peer("a"), 1);
        assert_eq!(state.latest_seen(&peer("a")), Some(3));

        state.observe(&peer("a"), 7);
        assert_eq!(state.latest_seen(&peer("a")), Some(7));
    }

    #[tokio::test]
    async fn test_observe_wakes_satisfied_waiters_only() {
        let state = SyncState::new();
        let (_g2, mut rx2) = state.register_waiter(&peer("a"), 2);
        let (_g5, mut rx5) = state.register_waiter(&peer("a"), 5);
        let (_gb, mut rxb) = state.register_waiter(&peer("b"), 2);

        state.observe(&peer("a"), 3);

        assert!(rx2.try_recv().is_ok());
        assert!(rx5.try_recv().is_err());
        assert!(rxb.try_recv().is_err());

        // The satisfied waiter is gone; the others remain.
        assert_eq!(state.diagnostics().version_waiters, 2);
    }

    #[test]
    fn test_waiter_guard_deregisters_on_drop() {
        let state = SyncState::new();
        {
            let (_guard, _rx) = state.register_waiter(&peer("a"), 2);
            assert_eq!(state.diagnostics().version_waiters, 1);
        }
        assert_eq!(state.diagnostics().version_waiters, 0);
    }

    #[test]
    fn test_multiple_waiters_same_threshold() {
        let state = SyncState::new();
        let (ga, mut rxa) = state.register_waiter(&peer("a"), 2);
        let (_gb, mut rxb) = state.register_waiter(&peer("a"), 2);
        assert_eq!(state.diagnostics().version_waiters, 2);

        // Dropping one guard leaves the other registered.
        drop(ga);
        assert_eq!(state.diagnostics().version_waiters, 1);
        assert!(rxa.try_recv().is_err());

        state.observe(&peer("a"), 2);
        assert!(rxb.try_recv().is_ok());
    }

    #[test]
    fn test_query_guard_removes_entry() {
        let map: DashMap<u64, oneshot::Sender<u64>> = DashMap::new();
        let (tx, _rx) = oneshot::channel();
        map.insert(9, tx);
        {
            let _guard = QueryGuard { map: &map, query_id: 9 };
        }
        assert!(map.is_empty());
    }
}
