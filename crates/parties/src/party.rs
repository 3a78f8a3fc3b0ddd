use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tillcore_core::{AggregateId, ValueObject};

/// Party identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub AggregateId);

impl PartyId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PartyId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Party kind: customer or supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Customer,
    Supplier,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
        }
    }
}

/// UUIDv5 namespace for ledger stream ids derived from party references.
const PARTY_STREAM_NAMESPACE: Uuid = Uuid::from_u128(0x8d3f_1f6a_52c4_4b0e_9a77_1c2e_0d4b_6f21);

/// Polymorphic reference to the party owning a ledger: kind + id.
///
/// One tagged value instead of two nullable foreign keys or a type-name
/// string; the kind participates in stream-id derivation, so a customer and
/// a supplier sharing a uuid still get separate ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyRef {
    pub kind: PartyKind,
    pub id: PartyId,
}

impl PartyRef {
    pub fn customer(id: PartyId) -> Self {
        Self {
            kind: PartyKind::Customer,
            id,
        }
    }

    pub fn supplier(id: PartyId) -> Self {
        Self {
            kind: PartyKind::Supplier,
            id,
        }
    }

    /// Deterministic ledger stream id for this party.
    pub fn stream_id(&self) -> AggregateId {
        let mut key = Vec::with_capacity(1 + 16);
        key.push(match self.kind {
            PartyKind::Customer => 0u8,
            PartyKind::Supplier => 1u8,
        });
        key.extend_from_slice(self.id.0.as_uuid().as_bytes());
        AggregateId::derived(&PARTY_STREAM_NAMESPACE, &key)
    }
}

impl ValueObject for PartyRef {}

impl core::fmt::Display for PartyRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_is_deterministic() {
        let id = PartyId::new(AggregateId::new());
        let a = PartyRef::customer(id).stream_id();
        let b = PartyRef::customer(id).stream_id();
        assert_eq!(a, b);
    }

    #[test]
    fn customer_and_supplier_with_same_id_get_distinct_streams() {
        let id = PartyId::new(AggregateId::new());
        let customer = PartyRef::customer(id).stream_id();
        let supplier = PartyRef::supplier(id).stream_id();
        assert_ne!(customer, supplier);
    }
}
