// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The mesh manager and its root-view handle.
//!
//! [`MeshManager`] binds the replication core to a cluster transport under
//! a configurable message tag. Construction spawns the two long-lived
//! tasks (inbound dispatch and connection tracking);
//! [`shutdown`](MeshManager::shutdown) fires the drain and awaits every
//! task the manager ever spawned, including in-flight fan-out and
//! sync-reply tasks.
//!
//! [`MeshHandle`] is the external surface: `get`, `join`, `sync_from`,
//! `sync_to`, `subscribe`, plus introspection accessors. Handles are cheap
//! to clone and survive the manager; every operation on a surviving handle
//! fails with [`MeshError::ManagerGone`] once the manager is gone.

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::lattice::Lattice;
use crate::metrics;
use crate::outbound::Dispatcher;
use crate::store::MetaStore;
use crate::sync::{self, SyncDiagnostics, SyncState};
use crate::tracker;
use crate::transport::{Connection, PeerId, Transport};
use crate::wire::{Message, WireEncode};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Shared state behind both the manager and its handles.
pub(crate) struct Core<M, T> {
    pub(crate) transport: Arc<T>,
    pub(crate) store: MetaStore<M>,
    pub(crate) sync: SyncState,
    pub(crate) dispatcher: Dispatcher<T>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

/// Owns the replication core for one metadata value on one transport.
pub struct MeshManager<M, T> {
    core: Arc<Core<M, T>>,
}

impl<M, T> MeshManager<M, T>
where
    M: Lattice + WireEncode,
    T: Transport,
{
    /// Bind the core to `transport` under the configured tag, seeded with
    /// `initial` at version 0.
    ///
    /// # Panics
    ///
    /// Panics if the transport already has live connections (the tracker
    /// must observe every connection from the start, or a peer would miss
    /// its bootstrap push), or if `config` is invalid.
    pub fn new(transport: Arc<T>, config: MeshConfig, initial: M) -> Self {
        if let Err(reason) = config.validate() {
            panic!("invalid mesh config: {reason}");
        }
        assert!(
            transport.watch_connections().borrow().is_empty(),
            "mesh manager must attach before any connections exist"
        );

        let tag = config.message_tag();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&transport),
            tag,
            config.outbound_permits,
            shutdown.clone(),
        );
        let inbound = transport.register(tag);

        let core = Arc::new(Core {
            transport,
            store: MetaStore::new(initial),
            sync: SyncState::new(),
            dispatcher,
            shutdown,
            tasks: TaskTracker::new(),
        });

        core.tasks.spawn(sync::run_inbound(Arc::clone(&core), inbound));
        core.tasks.spawn(tracker::run_tracker(Arc::clone(&core)));

        info!(tag = %tag, permits = config.outbound_permits, "Mesh manager started");
        Self { core }
    }

    /// A root-view handle onto this manager.
    pub fn handle(&self) -> MeshHandle<M, T> {
        MeshHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Shut the manager down.
    ///
    /// Fires the shutdown drain, then awaits every spawned task. Blocked
    /// sync operations on outstanding handles resolve to
    /// [`MeshError::ManagerGone`]; subsequent handle operations fail the
    /// same way.
    pub async fn shutdown(&mut self) {
        info!("Shutting down mesh manager");
        self.core.shutdown.cancel();
        self.core.tasks.close();
        self.core.tasks.wait().await;
        info!("Mesh manager stopped");
    }
}

impl<M, T> Drop for MeshManager<M, T> {
    fn drop(&mut self) {
        // Tasks cannot be awaited here; firing the drain lets them wind
        // down on their own and flips outstanding handles to ManagerGone.
        self.core.shutdown.cancel();
    }
}

/// The external handle: submit contributions, read snapshots, establish
/// sync checkpoints.
pub struct MeshHandle<M, T> {
    core: Weak<Core<M, T>>,
}

impl<M, T> Clone for MeshHandle<M, T> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

impl<M, T> MeshHandle<M, T>
where
    M: Lattice + WireEncode,
    T: Transport,
{
    fn core(&self) -> Result<Arc<Core<M, T>>> {
        let core = self.core.upgrade().ok_or(MeshError::ManagerGone)?;
        if core.shutdown.is_cancelled() {
            return Err(MeshError::ManagerGone);
        }
        Ok(core)
    }

    /// Snapshot of the current metadata value.
    pub fn get(&self) -> Result<M> {
        Ok(self.core()?.store.snapshot())
    }

    /// The local version: the number of local joins applied so far.
    pub fn version(&self) -> Result<u64> {
        Ok(self.core()?.store.version())
    }

    /// Submit a local contribution.
    ///
    /// Bumps the local version, merges the delta, fires subscribers, and
    /// schedules an independent best-effort push to every presently-known
    /// connection. Returns the new local version immediately; delivery to
    /// peers that drop before the send is repaired by the reconnect
    /// bootstrap.
    pub fn join(&self, delta: M) -> Result<u64> {
        let core = self.core()?;
        let version = core.store.local_join(delta.clone());
        metrics::record_local_join();

        let connections: Vec<Connection> = core
            .transport
            .watch_connections()
            .borrow()
            .values()
            .cloned()
            .collect();
        for conn in connections {
            metrics::record_fanout_send(conn.peer().as_str());
            let dispatcher = core.dispatcher.clone();
            let delta = delta.clone();
            core.tasks.spawn(async move {
                let _ = dispatcher
                    .send(
                        &conn,
                        &Message::Metadata { delta, version },
                        &CancellationToken::new(),
                    )
                    .await;
            });
        }
        Ok(version)
    }

    /// Wait until every update `peer` had applied when it answered this
    /// query has been merged locally.
    pub async fn sync_from(&self, peer: &PeerId, interrupt: &CancellationToken) -> Result<()> {
        let core = self.core()?;
        let result = sync::sync_from(&core, peer, interrupt).await;
        metrics::record_sync_outcome("sync_from", outcome_label(&result));
        result
    }

    /// Wait until `peer` has merged every update applied here at call time.
    pub async fn sync_to(&self, peer: &PeerId, interrupt: &CancellationToken) -> Result<()> {
        let core = self.core()?;
        let result = sync::sync_to(&core, peer, interrupt).await;
        metrics::record_sync_outcome("sync_to", outcome_label(&result));
        result
    }

    /// Register a callback invoked after each applied join, local or
    /// remote. The callback must not block; re-read the value via
    /// [`get`](Self::get).
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.core()?.store.subscribe(Arc::new(callback));
        Ok(())
    }

    /// Peers with a live connection right now, sorted.
    pub fn connected_peers(&self) -> Result<Vec<PeerId>> {
        let core = self.core()?;
        let mut peers: Vec<PeerId> = core
            .transport
            .watch_connections()
            .borrow()
            .keys()
            .cloned()
            .collect();
        peers.sort();
        Ok(peers)
    }

    /// The highest change version observed from `peer`, if any.
    pub fn peer_latest_seen(&self, peer: &PeerId) -> Result<Option<u64>> {
        Ok(self.core()?.sync.latest_seen(peer))
    }

    /// Outstanding synchronization state, for monitoring and tests.
    pub fn sync_diagnostics(&self) -> Result<SyncDiagnostics> {
        Ok(self.core()?.sync.diagnostics())
    }
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(MeshError::Interrupted) => "interrupted",
        Err(MeshError::SyncFailed { .. }) => "sync_failed",
        Err(MeshError::ManagerGone) => "manager_gone",
    }
}
