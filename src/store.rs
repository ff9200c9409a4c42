//! The authoritative metadata value and local version counter.
//!
//! [`MetaStore`] pairs the current semilattice value with the local version
//! counter under one lock, so readers always observe a consistent
//! (value, version) pair. The version counts local contributions only:
//! remote joins merge the value without bumping it.
//!
//! Change subscribers are notified after every applied join, local or
//! remote. Notification is deferred until the write lock is released, so a
//! subscriber can read the store (but should not block).

use crate::lattice::Lattice;
use std::sync::{Arc, Mutex, RwLock};

/// A change subscriber. Receives no payload; re-read the store for the
/// current value.
pub type Subscriber = Arc<dyn Fn() + Send + Sync>;

struct Shared<M> {
    value: M,
    version: u64,
}

/// Holds the current metadata value and the local version counter.
pub struct MetaStore<M> {
    shared: RwLock<Shared<M>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl<M: Lattice> MetaStore<M> {
    /// Create a store with an initial value at version 0.
    pub fn new(initial: M) -> Self {
        Self {
            shared: RwLock::new(Shared {
                value: initial,
                version: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current value.
    pub fn snapshot(&self) -> M {
        self.shared.read().expect("metadata lock poisoned").value.clone()
    }

    /// The local version: the number of local joins applied so far.
    pub fn version(&self) -> u64 {
        self.shared.read().expect("metadata lock poisoned").version
    }

    /// Consistent (value, version) pair, for the bootstrap push.
    pub fn versioned_snapshot(&self) -> (M, u64) {
        let shared = self.shared.read().expect("metadata lock poisoned");
        (shared.value.clone(), shared.version)
    }

    /// Apply a local contribution: bump the version, then merge the delta.
    ///
    /// Returns the post-increment version that tags the outbound metadata
    /// push for this change. Subscribers fire before this returns.
    pub fn local_join(&self, delta: M) -> u64 {
        let version = {
            let mut shared = self.shared.write().expect("metadata lock poisoned");
            shared.version += 1;
            shared.value.join(delta);
            shared.version
        };
        self.notify();
        version
    }

    /// Merge a remotely received delta. The local version is untouched.
    pub fn remote_join(&self, delta: M) {
        {
            let mut shared = self.shared.write().expect("metadata lock poisoned");
            shared.value.join(delta);
        }
        self.notify();
    }

    /// Register a subscriber invoked after each applied join.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    fn notify(&self) {
        // Clone the list out of the lock so a subscriber may register
        // further subscribers or read the store without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        for subscriber in subscribers {
            subscriber();
        }
    }
}
