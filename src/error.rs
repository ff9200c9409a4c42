// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mesh replication core.
//!
//! The core exposes exactly three failure modes to callers. Nothing is
//! retried internally: idempotent re-delivery is handled by the semilattice
//! algebra, and missed messages are repaired by the reconnect bootstrap.
//!
//! | Error | Meaning |
//! |-------|---------|
//! | `Interrupted` | The caller's interruptor fired while the operation was blocked. |
//! | `SyncFailed` | A connection the operation depended on drained, or no such connection exists. |
//! | `ManagerGone` | The owning [`MeshManager`](crate::MeshManager) was shut down while the handle was retained. |
//!
//! Internal anomalies are handled without surfacing: transport send failures
//! are silently dropped (the bootstrap push repairs them), duplicate sync
//! replies are logged and ignored, and garbled wire bytes abort the process
//! because the transport is trusted for framing and integrity.

use crate::transport::PeerId;
use thiserror::Error;

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors surfaced by [`MeshHandle`](crate::MeshHandle) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The caller's interruptor fired.
    ///
    /// The operation was abandoned cleanly: any registered waiter was
    /// deregistered before returning.
    #[error("Operation interrupted by caller")]
    Interrupted,

    /// A connection referenced by the sync operation drained, or the peer
    /// has no live connection.
    ///
    /// The remote peer may still converge later via the reconnect
    /// bootstrap; only the checkpoint this call was establishing is lost.
    #[error("Sync with peer {peer} failed: connection gone")]
    SyncFailed {
        /// The peer the operation was synchronizing with.
        peer: PeerId,
    },

    /// The underlying manager was destroyed while this handle was retained.
    #[error("Mesh manager has shut down")]
    ManagerGone,
}

impl MeshError {
    /// Shorthand constructor for [`MeshError::SyncFailed`].
    pub fn sync_failed(peer: &PeerId) -> Self {
        Self::SyncFailed { peer: peer.clone() }
    }

    /// True if the failure was requested by the caller rather than caused
    /// by the cluster.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
