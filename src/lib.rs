//! # Lattice Mesh
//!
//! Keeps a piece of monotonically-growing, conflict-free cluster metadata
//! (a join-semilattice value) eventually consistent across all peers of a
//! mesh. Any peer may submit a local contribution; the manager merges it
//! into the local copy and disseminates the change to every currently
//! connected peer. Received updates are merged the same way. Because joins
//! are commutative, associative, and idempotent, re-delivery and concurrent
//! updates are always safe.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           lattice-mesh                              │
//! │                                                                     │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────────────┐  │
//! │  │ MeshHandle │──►│ MetaStore  │──►│ Dispatcher (bounded sends)  │  │
//! │  │ (join/get) │   │ (M + vers) │   │ per-connection fan-out      │  │
//! │  └────────────┘   └────────────┘   └─────────────────────────────┘  │
//! │        │                 ▲                       │                  │
//! │        ▼                 │                       ▼                  │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────────────┐  │
//! │  │ sync_from/ │   │ inbound    │   │ tracker (bootstrap push on  │  │
//! │  │ sync_to    │◄──│ dispatch   │   │ every new connection)       │  │
//! │  └────────────┘   └────────────┘   └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dissemination
//!
//! 1. **Gossip on update**: a local [`MeshHandle::join`] fans the delta out
//!    to every connected peer as an independent task.
//! 2. **Bootstrap on connect**: a newly observed connection receives the
//!    full current value, which by idempotence repairs any missed deltas.
//!
//! ## Synchronization
//!
//! [`MeshHandle::sync_from`] and [`MeshHandle::sync_to`] establish causal
//! checkpoints: after `sync_from(p)` returns, every update `p` had applied
//! when it answered is merged locally; after `sync_to(p)` returns, `p` has
//! merged every update applied here at call time.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lattice_mesh::{GSet, MeshConfig, MeshManager};
//! use std::sync::Arc;
//!
//! # async fn example<T: lattice_mesh::Transport>(transport: Arc<T>) {
//! let mut manager = MeshManager::new(transport, MeshConfig::default(), GSet::<u64>::new());
//! let handle = manager.handle();
//!
//! handle.join(GSet::from_iter([1])).unwrap();
//! let snapshot = handle.get().unwrap();
//!
//! manager.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lattice;
pub mod manager;
pub mod metrics;
pub mod outbound;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use config::{MeshConfig, Tag, DEFAULT_OUTBOUND_PERMITS};
pub use error::{MeshError, Result};
pub use lattice::{GSet, Lattice};
pub use manager::{MeshHandle, MeshManager};
pub use store::MetaStore;
pub use sync::SyncDiagnostics;
pub use transport::{Connection, ConnectionMap, InboundFrame, PeerId, SendError, Transport};
pub use wire::{Message, WireEncode, WireVersion};
