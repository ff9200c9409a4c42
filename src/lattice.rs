//! Join-semilattice contract for replicated metadata.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:   a ⊔ a = a
//!
//! These laws are what make the replication core safe: message re-delivery,
//! reordering, and full-state bootstrap pushes all collapse into the same
//! converged value regardless of interleaving. The manager never needs to
//! deduplicate or order updates.
//!
//! The crate ships [`GSet`], a grow-only set, as the reference element type.
//! Any user type implementing [`Lattice`] works the same way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A join-semilattice element.
///
/// `join` must be commutative, associative, and idempotent. Equality is not
/// required by the replication core; convergence follows from the laws alone.
pub trait Lattice: Clone + Send + Sync + 'static {
    /// Merge `other` into `self` (least upper bound, in place).
    fn join(&mut self, other: Self);

    /// Consuming form of [`join`](Self::join).
    fn joined(mut self, other: Self) -> Self {
        self.join(other);
        self
    }
}

/// A grow-only set: the simplest useful join-semilattice.
///
/// `join` is set union. Elements can be added but never removed, so any two
/// replicas converge to the union of everything either has seen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GSet<T: Ord> {
    elements: BTreeSet<T>,
}

impl<T: Ord> GSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            elements: BTreeSet::new(),
        }
    }

    /// Add an element.
    pub fn insert(&mut self, value: T) -> bool {
        self.elements.insert(value)
    }

    /// Membership test.
    pub fn contains(&self, value: &T) -> bool {
        self.elements.contains(value)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True if no elements have been added.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate elements in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.iter()
    }

    /// True if every element of `self` is in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.elements.is_subset(&other.elements)
    }
}

impl<T: Ord> FromIterator<T> for GSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

impl<T: Ord> IntoIterator for GSet<T> {
    type Item = T;
    type IntoIter = std::collections::btree_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.into_iter()
    }
}

impl<T> Lattice for GSet<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    fn join(&mut self, other: Self) {
        self.elements.extend(other.elements);
    }
}
