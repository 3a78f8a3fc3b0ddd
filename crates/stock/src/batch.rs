use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tillcore_core::{DocRef, Entity, ItemId, LocationId};

/// Batch identifier (entity within an `ItemStock` aggregate).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Fresh time-ordered id. Prefer passing ids explicitly in tests.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One receipt lot of an item at a location.
///
/// Identity is immutable; only the four quantity counters move, and
/// `remaining` only ever decreases after receipt. Fully consumed batches are
/// kept (zeroed, never deleted) so the movement trail stays resolvable.
///
/// Invariant: `remaining + sold + damaged + returned == received`, all >= 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    /// Purchase document this lot was received against, if any.
    pub purchase_ref: Option<DocRef>,
    /// Free-form lot label (supplier batch number, etc.).
    pub label: String,
    pub received: i64,
    pub remaining: i64,
    pub sold: i64,
    pub damaged: i64,
    pub returned: i64,
    /// Unit cost in smallest currency unit (e.g., cents).
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
}

impl Entity for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Batch {
    /// Conservation check over the four quantity counters.
    pub fn conservation_holds(&self) -> bool {
        self.remaining >= 0
            && self.sold >= 0
            && self.damaged >= 0
            && self.returned >= 0
            && self.remaining + self.sold + self.damaged + self.returned == self.received
    }

    /// Whether this batch still holds stock that can be consumed or returned.
    pub fn has_remaining(&self) -> bool {
        self.remaining > 0
    }

    /// Whether this batch belongs to the given purchase document.
    pub fn belongs_to_purchase(&self, purchase_doc_id: &Uuid) -> bool {
        self.purchase_ref
            .as_ref()
            .is_some_and(|r| r.doc_id == *purchase_doc_id)
    }
}
