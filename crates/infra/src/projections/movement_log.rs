//! Movement Log Projection.
//!
//! Append-only audit trail of every physical stock change: one row per batch
//! touched, with before/after quantity snapshots. Rows are never updated or
//! deleted; the log is rebuildable from the stock event stream.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use tillcore_core::{AggregateId, DocRef, ItemId, LocationId, TenantId, UserId};
use tillcore_events::EventEnvelope;
use tillcore_stock::{BatchId, ConsumptionKind, ReceiptKind, StockEvent};

/// Kind of quantity change a movement records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovementKind {
    Purchase,
    Sale,
    Adjustment,
    TransferIn,
    TransferOut,
    Damage,
    Return,
}

impl From<ReceiptKind> for MovementKind {
    fn from(kind: ReceiptKind) -> Self {
        match kind {
            ReceiptKind::Purchase => MovementKind::Purchase,
            ReceiptKind::TransferIn => MovementKind::TransferIn,
            ReceiptKind::Adjustment => MovementKind::Adjustment,
        }
    }
}

impl From<ConsumptionKind> for MovementKind {
    fn from(kind: ConsumptionKind) -> Self {
        match kind {
            ConsumptionKind::Sale => MovementKind::Sale,
            ConsumptionKind::Damage => MovementKind::Damage,
            ConsumptionKind::Adjustment => MovementKind::Adjustment,
            ConsumptionKind::TransferOut => MovementKind::TransferOut,
        }
    }
}

/// Immutable audit record of one stock quantity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    pub id: Uuid,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub batch_id: Option<BatchId>,
    pub kind: MovementKind,
    /// Signed quantity change.
    pub delta: i64,
    pub from_quantity: i64,
    pub to_quantity: i64,
    pub unit_cost: Option<u64>,
    /// Business document that caused the change.
    pub source: Option<DocRef>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Filter for movement history queries (audit trails, statements).
#[derive(Debug, Clone, Default)]
pub struct MovementQuery {
    pub item_id: Option<ItemId>,
    pub location_id: Option<LocationId>,
    pub kind: Option<MovementKind>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    /// Match movements caused by a specific business document.
    pub source_doc_id: Option<Uuid>,
}

impl MovementQuery {
    fn matches(&self, movement: &Movement) -> bool {
        if self.item_id.is_some_and(|id| movement.item_id != id) {
            return false;
        }
        if self.location_id.is_some_and(|id| movement.location_id != id) {
            return false;
        }
        if self.kind.is_some_and(|k| movement.kind != k) {
            return false;
        }
        if self
            .occurred_after
            .is_some_and(|t| movement.occurred_at < t)
        {
            return false;
        }
        if self
            .occurred_before
            .is_some_and(|t| movement.occurred_at > t)
        {
            return false;
        }
        if let Some(doc_id) = self.source_doc_id {
            return movement
                .source
                .as_ref()
                .is_some_and(|s| s.doc_id == doc_id);
        }
        true
    }
}

/// Tenant+aggregate cursor for idempotent projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum MovementLogError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Movement log projection: append-only audit rows from stock events.
///
/// Tenant-isolated, idempotent for at-least-once delivery, rebuildable.
#[derive(Debug, Default)]
pub struct MovementLogProjection {
    movements: RwLock<HashMap<TenantId, Vec<Movement>>>,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl MovementLogProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full movement history for a tenant, in apply order.
    pub fn list(&self, tenant_id: TenantId) -> Vec<Movement> {
        self.movements
            .read()
            .ok()
            .and_then(|m| m.get(&tenant_id).cloned())
            .unwrap_or_default()
    }

    /// Movement history matching a filter.
    pub fn query(&self, tenant_id: TenantId, filter: &MovementQuery) -> Vec<Movement> {
        self.list(tenant_id)
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect()
    }

    /// Apply a published envelope into the log.
    ///
    /// - Enforces tenant isolation
    /// - Enforces monotonic sequence per (tenant, aggregate) stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), MovementLogError> {
        if envelope.aggregate_type() != "stock.item" {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let Ok(mut cursors) = self.cursors.write() {
            let key = CursorKey {
                tenant_id,
                aggregate_id,
            };
            let last = *cursors.get(&key).unwrap_or(&0);

            if seq == 0 {
                return Err(MovementLogError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(MovementLogError::NonMonotonicSequence { last, found: seq });
            }

            let event: StockEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| MovementLogError::Deserialize(e.to_string()))?;

            let event_tenant = match &event {
                StockEvent::BatchReceived(e) => e.tenant_id,
                StockEvent::StockConsumed(e) => e.tenant_id,
                StockEvent::StockReturned(e) => e.tenant_id,
            };
            if event_tenant != tenant_id {
                return Err(MovementLogError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }

            let rows = movements_for(&event);
            if let Ok(mut movements) = self.movements.write() {
                movements.entry(tenant_id).or_default().extend(rows);
            }

            cursors.insert(key, seq);
        }

        Ok(())
    }

    /// Rebuild the log from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), MovementLogError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        {
            let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
            tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
            tenants.dedup();

            if let Ok(mut movements) = self.movements.write() {
                for t in &tenants {
                    movements.remove(t);
                }
            }
            if let Ok(mut cursors) = self.cursors.write() {
                for t in &tenants {
                    cursors.retain(|k, _| k.tenant_id != *t);
                }
            }
        }

        // Deterministic replay order: tenant, aggregate, sequence.
        envs.sort_by_key(|e| {
            (
                *e.tenant_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}

/// Translate one stock event into its audit rows.
///
/// Consumptions and returns produce one row per batch touched; from/to
/// snapshots run cumulatively from the event's starting total.
fn movements_for(event: &StockEvent) -> Vec<Movement> {
    match event {
        StockEvent::BatchReceived(e) => vec![Movement {
            id: Uuid::now_v7(),
            item_id: e.item_id,
            location_id: e.location_id,
            batch_id: Some(e.batch_id),
            kind: e.kind.into(),
            delta: e.quantity,
            from_quantity: e.quantity_before,
            to_quantity: e.quantity_after,
            unit_cost: Some(e.unit_cost),
            source: e.purchase_ref.clone(),
            actor: e.actor,
            occurred_at: e.occurred_at,
        }],
        StockEvent::StockConsumed(e) => {
            let mut running = e.quantity_before;
            e.allocations
                .iter()
                .map(|a| {
                    let from = running;
                    running -= a.quantity;
                    Movement {
                        id: Uuid::now_v7(),
                        item_id: e.item_id,
                        location_id: e.location_id,
                        batch_id: Some(a.batch_id),
                        kind: e.kind.into(),
                        delta: -a.quantity,
                        from_quantity: from,
                        to_quantity: running,
                        unit_cost: Some(a.unit_cost),
                        source: Some(e.source.clone()),
                        actor: e.actor,
                        occurred_at: e.occurred_at,
                    }
                })
                .collect()
        }
        StockEvent::StockReturned(e) => {
            let mut running = e.quantity_before;
            e.allocations
                .iter()
                .map(|a| {
                    let from = running;
                    running -= a.quantity;
                    Movement {
                        id: Uuid::now_v7(),
                        item_id: e.item_id,
                        location_id: e.location_id,
                        batch_id: Some(a.batch_id),
                        kind: MovementKind::Return,
                        delta: -a.quantity,
                        from_quantity: from,
                        to_quantity: running,
                        unit_cost: Some(a.unit_cost),
                        source: Some(e.return_ref.clone()),
                        actor: e.actor,
                        occurred_at: e.occurred_at,
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillcore_core::DocumentKind;
    use tillcore_stock::{BatchAllocation, BatchReceived, StockConsumed};

    fn make_envelope(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        seq: u64,
        event: StockEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            "stock.item".to_string(),
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn received(
        tenant_id: TenantId,
        item_id: ItemId,
        location_id: LocationId,
        batch_id: BatchId,
        quantity: i64,
    ) -> StockEvent {
        StockEvent::BatchReceived(BatchReceived {
            tenant_id,
            item_id,
            location_id,
            batch_id,
            kind: ReceiptKind::Purchase,
            quantity,
            unit_cost: 100,
            expiry_date: None,
            purchase_ref: Some(DocRef::new(DocumentKind::Purchase, Uuid::now_v7(), "PO-1")),
            label: String::new(),
            quantity_before: 0,
            quantity_after: quantity,
            actor: None,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn consumption_emits_one_row_per_batch_with_running_snapshots() {
        let log = MovementLogProjection::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();
        let item_id = ItemId::new();
        let location_id = LocationId::new();
        let b1 = BatchId::new();
        let b2 = BatchId::new();

        log.apply_envelope(&make_envelope(
            tenant_id,
            aggregate_id,
            1,
            received(tenant_id, item_id, location_id, b1, 10),
        ))
        .unwrap();

        let consumed = StockEvent::StockConsumed(StockConsumed {
            tenant_id,
            item_id,
            location_id,
            kind: ConsumptionKind::Sale,
            allocations: vec![
                BatchAllocation {
                    batch_id: b1,
                    quantity: 10,
                    unit_cost: 100,
                },
                BatchAllocation {
                    batch_id: b2,
                    quantity: 5,
                    unit_cost: 120,
                },
            ],
            source: DocRef::new(DocumentKind::Sale, Uuid::now_v7(), "INV-1"),
            quantity_before: 20,
            quantity_after: 5,
            actor: None,
            occurred_at: Utc::now(),
        });
        log.apply_envelope(&make_envelope(tenant_id, aggregate_id, 2, consumed))
            .unwrap();

        let rows = log.list(tenant_id);
        assert_eq!(rows.len(), 3);

        let sale_rows: Vec<_> = rows
            .iter()
            .filter(|m| m.kind == MovementKind::Sale)
            .collect();
        assert_eq!(sale_rows.len(), 2);
        assert_eq!(sale_rows[0].delta, -10);
        assert_eq!(sale_rows[0].from_quantity, 20);
        assert_eq!(sale_rows[0].to_quantity, 10);
        assert_eq!(sale_rows[1].delta, -5);
        assert_eq!(sale_rows[1].from_quantity, 10);
        assert_eq!(sale_rows[1].to_quantity, 5);
    }

    #[test]
    fn duplicate_envelopes_are_ignored() {
        let log = MovementLogProjection::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        let env = make_envelope(
            tenant_id,
            aggregate_id,
            1,
            received(tenant_id, ItemId::new(), LocationId::new(), BatchId::new(), 4),
        );
        log.apply_envelope(&env).unwrap();
        log.apply_envelope(&env).unwrap();

        assert_eq!(log.list(tenant_id).len(), 1);
    }

    #[test]
    fn query_filters_by_item_and_kind() {
        let log = MovementLogProjection::new();
        let tenant_id = TenantId::new();
        let location_id = LocationId::new();
        let item_a = ItemId::new();
        let item_b = ItemId::new();
        let agg_a = AggregateId::new();
        let agg_b = AggregateId::new();

        log.apply_envelope(&make_envelope(
            tenant_id,
            agg_a,
            1,
            received(tenant_id, item_a, location_id, BatchId::new(), 4),
        ))
        .unwrap();
        log.apply_envelope(&make_envelope(
            tenant_id,
            agg_b,
            1,
            received(tenant_id, item_b, location_id, BatchId::new(), 6),
        ))
        .unwrap();

        let by_item = log.query(
            tenant_id,
            &MovementQuery {
                item_id: Some(item_a),
                ..MovementQuery::default()
            },
        );
        assert_eq!(by_item.len(), 1);
        assert_eq!(by_item[0].delta, 4);

        let by_kind = log.query(
            tenant_id,
            &MovementQuery {
                kind: Some(MovementKind::Purchase),
                ..MovementQuery::default()
            },
        );
        assert_eq!(by_kind.len(), 2);
    }
}
