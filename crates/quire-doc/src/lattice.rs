//! Full-state merge of replicas.
//!
//! Two replicas that exchanged everything hold the same document, whatever
//! order the exchange happened in. [`Lattice::join`] is that exchange done in
//! one step, and the property tests pin down its laws: joining is
//! commutative, associative and idempotent, with an empty replica as the
//! identity.

/// State merge of two replicas of the same document.
pub trait Lattice: Clone + PartialEq {
    /// A replica holding nothing.
    fn bottom() -> Self;

    /// A replica holding everything `self` and `other` hold.
    fn join(&self, other: &Self) -> Self;

    /// Pull everything from `other` into `self`.
    fn merge_from(&mut self, other: &Self) {
        *self = self.join(other);
    }

    /// Whether `other` already holds everything `self` holds.
    fn is_covered_by(&self, other: &Self) -> bool {
        &self.join(other) == other
    }
}
