//! Stock Levels Projection.
//!
//! Fast-lookup cached total per (item, location), kept in sync with batch
//! reality by the stock event stream. Rows are created lazily on the first
//! batch write and never deleted. `rebuild_from_scratch` is the repair path
//! for drift caused by out-of-band edits: a full deterministic replay.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tillcore_core::{AggregateId, ItemId, LocationId, TenantId};
use tillcore_events::EventEnvelope;
use tillcore_stock::StockEvent;

use crate::read_model::TenantStore;

/// Read model: cached stock level for one (item, location).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub item_id: ItemId,
    pub location_id: LocationId,
    /// Cached sum of all batch `remaining` for this item+location.
    pub quantity: i64,
    /// Quantity set aside by order workflows outside the core.
    pub reserved: i64,
    /// Alerting layers poll `quantity` against this.
    pub reorder_threshold: i64,
    pub last_movement_at: Option<DateTime<Utc>>,
}

impl StockLevel {
    fn new(item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            item_id,
            location_id,
            quantity: 0,
            reserved: 0,
            reorder_threshold: 0,
            last_movement_at: None,
        }
    }

    pub fn needs_reorder(&self) -> bool {
        self.reorder_threshold > 0 && self.quantity <= self.reorder_threshold
    }
}

/// Tenant+aggregate cursor to support at-least-once delivery (idempotent projection).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum StockLevelProjectionError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock levels projection.
///
/// Consumes published envelopes (JSON payloads) and maintains a
/// tenant-isolated read model keyed by (item, location). Read models are
/// disposable and rebuildable from the event stream.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: TenantStore<(ItemId, LocationId), StockLevel>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: TenantStore<(ItemId, LocationId), StockLevel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Query read model for one (item, location).
    pub fn get(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        location_id: LocationId,
    ) -> Option<StockLevel> {
        self.store.get(tenant_id, &(item_id, location_id))
    }

    /// List all stock levels for a tenant.
    pub fn list(&self, tenant_id: TenantId) -> Vec<StockLevel> {
        self.store.list(tenant_id)
    }

    /// Rows at or below their reorder threshold (for the alerting layer).
    pub fn list_needing_reorder(&self, tenant_id: TenantId) -> Vec<StockLevel> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(StockLevel::needs_reorder)
            .collect()
    }

    /// Set the reorder threshold for one (item, location); creates the row
    /// lazily if no batch has been received yet.
    pub fn set_reorder_threshold(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        location_id: LocationId,
        threshold: i64,
    ) {
        let mut level = self
            .store
            .get(tenant_id, &(item_id, location_id))
            .unwrap_or_else(|| StockLevel::new(item_id, location_id));
        level.reorder_threshold = threshold;
        self.store.upsert(tenant_id, (item_id, location_id), level);
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Enforces tenant isolation
    /// - Enforces monotonic sequence per (tenant, aggregate) stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockLevelProjectionError> {
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
                return Err(StockLevelProjectionError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(StockLevelProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: StockEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| StockLevelProjectionError::Deserialize(e.to_string()))?;

            let (event_tenant, item_id, location_id, quantity_after, occurred_at) = match &event {
                StockEvent::BatchReceived(e) => (
                    e.tenant_id,
                    e.item_id,
                    e.location_id,
                    e.quantity_after,
                    e.occurred_at,
                ),
                StockEvent::StockConsumed(e) => (
                    e.tenant_id,
                    e.item_id,
                    e.location_id,
                    e.quantity_after,
                    e.occurred_at,
                ),
                StockEvent::StockReturned(e) => (
                    e.tenant_id,
                    e.item_id,
                    e.location_id,
                    e.quantity_after,
                    e.occurred_at,
                ),
            };

            if event_tenant != tenant_id {
                return Err(StockLevelProjectionError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }

            let mut level = self
                .store
                .get(tenant_id, &(item_id, location_id))
                .unwrap_or_else(|| StockLevel::new(item_id, location_id));
            level.quantity = quantity_after;
            level.last_movement_at = Some(occurred_at);
            self.store.upsert(tenant_id, (item_id, location_id), level);

            // Advance cursor after successful apply.
            cursors.insert(key, seq);
        }

        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    ///
    /// This is the reconciliation path: for every (item, location) with any
    /// batch history, the cached quantity is recomputed from the stream,
    /// repairing any drift. Idempotent.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StockLevelProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();

        {
            let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
            tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
            tenants.dedup();
            for t in tenants {
                self.store.clear_tenant(t);
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
