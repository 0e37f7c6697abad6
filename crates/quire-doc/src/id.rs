//! Identifiers and state vectors.

use crate::error::{DocError, Result};
use crate::update::codec;
use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a replica instance. A fresh one is drawn for every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draw a random non-zero client id over the full 64-bit range.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..=u64::MAX))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique id of an operation: the creating client and its logical clock.
///
/// Clocks are contiguous per client, starting at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub client: ClientId,
    pub clock: u64,
}

impl OpId {
    pub fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.client)
    }
}

/// Summary of the operations a replica has integrated: for each client, the
/// next clock it expects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for a client (zero if never seen).
    pub fn get(&self, client: ClientId) -> u64 {
        self.0.get(&client).copied().unwrap_or(0)
    }

    /// Record that every clock below `next` has been integrated.
    pub fn advance(&mut self, client: ClientId, next: u64) {
        let entry = self.0.entry(client).or_insert(0);
        if next > *entry {
            *entry = next;
        }
    }

    /// Whether the operation is already covered by this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.clock < self.get(id.client)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.0.iter().map(|(c, n)| (*c, *n))
    }

    /// Encode with the same binary format as updates.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| DocError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec()
            .deserialize(bytes)
            .map_err(|e| DocError::MalformedUpdate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_client_ids_use_full_width() {
        let ids: Vec<ClientId> = (0..64).map(|_| ClientId::random()).collect();
        assert!(ids.iter().all(|id| id.0 != 0));
        assert!(ids.iter().any(|id| id.0 > u64::from(u32::MAX)));
    }

    #[test]
    fn test_state_vector_advance_is_monotonic() {
        let mut sv = StateVector::new();
        let a = ClientId::new(1);

        sv.advance(a, 3);
        sv.advance(a, 2);
        assert_eq!(sv.get(a), 3);
        assert_eq!(sv.get(ClientId::new(9)), 0);
    }

    #[test]
    fn test_state_vector_contains() {
        let mut sv = StateVector::new();
        let a = ClientId::new(1);
        sv.advance(a, 2);

        assert!(sv.contains(&OpId::new(a, 0)));
        assert!(sv.contains(&OpId::new(a, 1)));
        assert!(!sv.contains(&OpId::new(a, 2)));
    }

    #[test]
    fn test_state_vector_binary_form() {
        let mut sv = StateVector::new();
        sv.advance(ClientId::new(7), 12);
        sv.advance(ClientId::new(3), 1);

        let bytes = sv.encode().unwrap();
        assert_eq!(StateVector::decode(&bytes).unwrap(), sv);
        assert!(StateVector::decode(&[0xff]).is_err());
    }
}
