//! Connection tracking and the reconnect bootstrap.
//!
//! Watches the transport's connection map. Each newly observed connection
//! gets a keepalive lease and a full-state bootstrap push: the remote peer
//! may have missed any number of deltas while disconnected, and sending the
//! whole current value is safe because joins are idempotent. Connections
//! that vanish from the map have their lease dropped, letting the transport
//! reap them.
//!
//! Tracking is keyed by connection identity, not by peer: a reconnect
//! produces a new handle for the same peer, which must be treated as a new
//! connection (and re-bootstrapped).

use crate::lattice::Lattice;
use crate::manager::Core;
use crate::metrics;
use crate::transport::{Connection, Transport};
use crate::wire::{Message, WireEncode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// The connection tracker task.
///
/// Runs until the manager shutdown drain fires or the transport drops its
/// side of the watch channel. On exit the tracked leases are released.
pub(crate) async fn run_tracker<M, T>(core: Arc<Core<M, T>>)
where
    M: Lattice + WireEncode,
    T: Transport,
{
    let mut watcher = core.transport.watch_connections();
    let mut tracked: HashMap<usize, Connection> = HashMap::new();

    loop {
        reconcile(&core, &mut watcher, &mut tracked);
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            changed = watcher.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    trace!(tracked = tracked.len(), "Connection tracker stopped");
}

/// Bring the tracked set in line with the transport's current map.
fn reconcile<M, T>(
    core: &Arc<Core<M, T>>,
    watcher: &mut watch::Receiver<crate::transport::ConnectionMap>,
    tracked: &mut HashMap<usize, Connection>,
) where
    M: Lattice + WireEncode,
    T: Transport,
{
    let current: Vec<Connection> = watcher.borrow_and_update().values().cloned().collect();

    for conn in &current {
        if tracked.contains_key(&conn.id()) {
            continue;
        }
        tracked.insert(conn.id(), conn.clone());
        info!(peer_id = %conn.peer(), "New connection; scheduling bootstrap push");
        metrics::record_bootstrap_push(conn.peer().as_str());

        // Full current state, captured as a consistent pair.
        let (value, version) = core.store.versioned_snapshot();
        let dispatcher = core.dispatcher.clone();
        let conn = conn.clone();
        core.tasks.spawn(async move {
            let _ = dispatcher
                .send(
                    &conn,
                    &Message::Metadata {
                        delta: value,
                        version,
                    },
                    &CancellationToken::new(),
                )
                .await;
        });
    }

    let live: HashSet<usize> = current.iter().map(Connection::id).collect();
    tracked.retain(|id, conn| {
        let keep = live.contains(id);
        if !keep {
            debug!(peer_id = %conn.peer(), "Connection gone; releasing lease");
        }
        keep
    });
    metrics::set_tracked_connections(tracked.len());
}
