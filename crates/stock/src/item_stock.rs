use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tillcore_core::{
    Aggregate, AggregateId, AggregateRoot, DocRef, DomainError, ItemId, LocationId, TenantId,
    UserId,
};
use tillcore_events::Event;

use crate::batch::{Batch, BatchId};

/// UUIDv5 namespace for stock stream ids derived from (item, location).
const STOCK_STREAM_NAMESPACE: Uuid = Uuid::from_u128(0x4e9b_7c1d_a3f2_4d58_8b06_5a9e_2f70_c413);

/// Stock stream identifier: one stream per (item, location).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockStreamId(pub AggregateId);

impl StockStreamId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// Deterministic stream id for an (item, location) pair.
    ///
    /// Every writer addressing the same pair lands on the same stream, which
    /// is what serializes concurrent allocations against shared batches.
    pub fn for_key(item_id: ItemId, location_id: LocationId) -> Self {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(item_id.as_uuid().as_bytes());
        key.extend_from_slice(location_id.as_uuid().as_bytes());
        Self(AggregateId::derived(&STOCK_STREAM_NAMESPACE, &key))
    }
}

impl core::fmt::Display for StockStreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Why stock arrived: fresh purchase lot, inbound transfer, or count correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Purchase,
    TransferIn,
    Adjustment,
}

/// Why stock left: sale, damage write-off, count correction, outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionKind {
    Sale,
    Damage,
    Adjustment,
    TransferOut,
}

/// Aggregate root: ItemStock, all batches of one item at one location.
///
/// The cached `quantity` equals the sum of batch `remaining` after every
/// applied event; readers that need the live total within an operation use
/// this aggregate, everyone else reads the stock-level projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStock {
    id: StockStreamId,
    tenant_id: Option<TenantId>,
    item_id: Option<ItemId>,
    location_id: Option<LocationId>,
    batches: Vec<Batch>,
    quantity: i64,
    last_movement_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl ItemStock {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: StockStreamId) -> Self {
        Self {
            id,
            tenant_id: None,
            item_id: None,
            location_id: None,
            batches: Vec::new(),
            quantity: 0,
            last_movement_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> StockStreamId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn item_id(&self) -> Option<ItemId> {
        self.item_id
    }

    pub fn location_id(&self) -> Option<LocationId> {
        self.location_id
    }

    /// Cached total: sum of `remaining` over all batches.
    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn last_movement_at(&self) -> Option<DateTime<Utc>> {
        self.last_movement_at
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Recompute the total from batches (repair/audit tooling; the cached
    /// value must already agree).
    pub fn batch_sum(&self) -> i64 {
        self.batches.iter().map(|b| b.remaining).sum()
    }

    /// Check every batch's conservation invariant and the cached total.
    pub fn verify_invariants(&self) -> Result<(), DomainError> {
        for batch in &self.batches {
            if !batch.conservation_holds() {
                return Err(DomainError::invariant(format!(
                    "batch {} counters out of balance",
                    batch.id
                )));
            }
        }
        if self.quantity != self.batch_sum() {
            return Err(DomainError::invariant(format!(
                "cached quantity {} does not match batch sum {}",
                self.quantity,
                self.batch_sum()
            )));
        }
        Ok(())
    }
}

/// Command: ReceiveBatch. Creates a fresh lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBatch {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub batch_id: BatchId,
    pub kind: ReceiptKind,
    pub quantity: i64,
    /// Unit cost in smallest currency unit.
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
    pub purchase_ref: Option<DocRef>,
    pub label: String,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AllocateConsumption. Takes stock FIFO across batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateConsumption {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub kind: ConsumptionKind,
    pub quantity: i64,
    pub source: DocRef,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AllocateReturn. Hands stock back to the supplier it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateReturn {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: i64,
    /// Purchase document whose batches are eligible.
    pub purchase_ref: DocRef,
    /// The return document causing this allocation.
    pub return_ref: DocRef,
    pub reason: String,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    ReceiveBatch(ReceiveBatch),
    AllocateConsumption(AllocateConsumption),
    AllocateReturn(AllocateReturn),
}

/// One batch's share of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAllocation {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub unit_cost: u64,
}

/// Event: BatchReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceived {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub batch_id: BatchId,
    pub kind: ReceiptKind,
    pub quantity: i64,
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
    pub purchase_ref: Option<DocRef>,
    pub label: String,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockConsumed. One event per call; allocations per batch touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConsumed {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub kind: ConsumptionKind,
    pub allocations: Vec<BatchAllocation>,
    pub source: DocRef,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReturned {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub purchase_ref: DocRef,
    pub return_ref: DocRef,
    pub allocations: Vec<BatchAllocation>,
    pub reason: String,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    BatchReceived(BatchReceived),
    StockConsumed(StockConsumed),
    StockReturned(StockReturned),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::BatchReceived(_) => "stock.item.batch_received",
            StockEvent::StockConsumed(_) => "stock.item.consumed",
            StockEvent::StockReturned(_) => "stock.item.returned",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::BatchReceived(e) => e.occurred_at,
            StockEvent::StockConsumed(e) => e.occurred_at,
            StockEvent::StockReturned(e) => e.occurred_at,
        }
    }
}

impl AggregateRoot for ItemStock {
    type Id = StockStreamId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for ItemStock {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::BatchReceived(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.item_id = Some(e.item_id);
                self.location_id = Some(e.location_id);
                self.created = true;
                self.batches.push(Batch {
                    id: e.batch_id,
                    item_id: e.item_id,
                    location_id: e.location_id,
                    purchase_ref: e.purchase_ref.clone(),
                    label: e.label.clone(),
                    received: e.quantity,
                    remaining: e.quantity,
                    sold: 0,
                    damaged: 0,
                    returned: 0,
                    unit_cost: e.unit_cost,
                    expiry_date: e.expiry_date,
                    received_at: e.occurred_at,
                });
                self.last_movement_at = Some(e.occurred_at);
            }
            StockEvent::StockConsumed(e) => {
                for allocation in &e.allocations {
                    if let Some(batch) =
                        self.batches.iter_mut().find(|b| b.id == allocation.batch_id)
                    {
                        batch.remaining -= allocation.quantity;
                        // Damage books against `damaged`; every other
                        // consumption kind books against `sold`.
                        match e.kind {
                            ConsumptionKind::Damage => batch.damaged += allocation.quantity,
                            _ => batch.sold += allocation.quantity,
                        }
                    }
                }
                self.last_movement_at = Some(e.occurred_at);
            }
            StockEvent::StockReturned(e) => {
                for allocation in &e.allocations {
                    if let Some(batch) =
                        self.batches.iter_mut().find(|b| b.id == allocation.batch_id)
                    {
                        batch.remaining -= allocation.quantity;
                        batch.returned += allocation.quantity;
                    }
                }
                self.last_movement_at = Some(e.occurred_at);
            }
        }

        // The cached total is recomputed from batches on every event so the
        // aggregate invariant cannot drift within a stream.
        self.quantity = self.batch_sum();

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::ReceiveBatch(cmd) => self.handle_receive(cmd),
            StockCommand::AllocateConsumption(cmd) => self.handle_consume(cmd),
            StockCommand::AllocateReturn(cmd) => self.handle_return(cmd),
        }
    }
}

impl ItemStock {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_key(&self, item_id: ItemId, location_id: LocationId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.item_id != Some(item_id) || self.location_id != Some(location_id) {
            return Err(DomainError::invariant("item/location mismatch for stream"));
        }
        Ok(())
    }

    /// Batches eligible for consumption, oldest receipt first.
    ///
    /// FIFO is receipt order, not expiry order. Stable sort keeps the append
    /// order for batches received at the same instant.
    fn fifo_candidates(&self) -> Vec<&Batch> {
        let mut candidates: Vec<&Batch> =
            self.batches.iter().filter(|b| b.has_remaining()).collect();
        candidates.sort_by_key(|b| b.received_at);
        candidates
    }

    fn greedy_allocate(candidates: &[&Batch], requested: i64) -> Vec<BatchAllocation> {
        let mut need = requested;
        let mut allocations = Vec::new();
        for batch in candidates {
            if need == 0 {
                break;
            }
            let take = need.min(batch.remaining);
            allocations.push(BatchAllocation {
                batch_id: batch.id,
                quantity: take,
                unit_cost: batch.unit_cost,
            });
            need -= take;
        }
        allocations
    }

    fn handle_receive(&self, cmd: &ReceiveBatch) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.item_id, cmd.location_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.batches.iter().any(|b| b.id == cmd.batch_id) {
            return Err(DomainError::conflict("batch already exists"));
        }

        Ok(vec![StockEvent::BatchReceived(BatchReceived {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            location_id: cmd.location_id,
            batch_id: cmd.batch_id,
            kind: cmd.kind,
            quantity: cmd.quantity,
            unit_cost: cmd.unit_cost,
            expiry_date: cmd.expiry_date,
            purchase_ref: cmd.purchase_ref.clone(),
            label: cmd.label.clone(),
            quantity_before: self.quantity,
            quantity_after: self.quantity + cmd.quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_consume(&self, cmd: &AllocateConsumption) -> Result<Vec<StockEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.item_id, cmd.location_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let candidates = self.fifo_candidates();
        let available: i64 = candidates.iter().map(|b| b.remaining).sum();
        if available < cmd.quantity {
            return Err(DomainError::insufficient_stock(cmd.quantity, available));
        }

        let allocations = Self::greedy_allocate(&candidates, cmd.quantity);

        Ok(vec![StockEvent::StockConsumed(StockConsumed {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            location_id: cmd.location_id,
            kind: cmd.kind,
            allocations,
            source: cmd.source.clone(),
            quantity_before: self.quantity,
            quantity_after: self.quantity - cmd.quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_return(&self, cmd: &AllocateReturn) -> Result<Vec<StockEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_key(cmd.item_id, cmd.location_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        // Only stock still on hand from this purchase is returnable; units
        // already sold, damaged or previously returned are out. Because
        // `remaining` already reflects earlier returns, the cap is cumulative
        // across calls.
        let mut candidates: Vec<&Batch> = self
            .batches
            .iter()
            .filter(|b| b.has_remaining() && b.belongs_to_purchase(&cmd.purchase_ref.doc_id))
            .collect();
        candidates.sort_by_key(|b| b.received_at);

        let returnable: i64 = candidates.iter().map(|b| b.remaining).sum();
        if cmd.quantity > returnable {
            return Err(DomainError::exceeds_returnable(cmd.quantity, returnable));
        }

        let allocations = Self::greedy_allocate(&candidates, cmd.quantity);

        Ok(vec![StockEvent::StockReturned(StockReturned {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            location_id: cmd.location_id,
            purchase_ref: cmd.purchase_ref.clone(),
            return_ref: cmd.return_ref.clone(),
            allocations,
            reason: cmd.reason.clone(),
            quantity_before: self.quantity,
            quantity_after: self.quantity - cmd.quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
