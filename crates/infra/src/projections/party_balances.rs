//! Party Balances Projection.
//!
//! Denormalized balance cache per party (customer or supplier), equal to the
//! most recent ledger entry's stored balance. Written only from ledger
//! events (appends and recalculations); no other code path read-modifies it.
//! A soft delete intentionally leaves the cache stale until the ledger is
//! recalculated.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tillcore_core::{AggregateId, TenantId};
use tillcore_events::EventEnvelope;
use tillcore_ledger::LedgerEvent;
use tillcore_parties::{PartyKind, PartyRef};

use crate::read_model::TenantStore;

/// Read model: cached balance for one party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyBalance {
    pub party: PartyRef,
    /// Positive: the party owes us; negative: we owe the party.
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Tenant+aggregate cursor for idempotent projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum PartyBalanceProjectionError {
    #[error("failed to deserialize ledger event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Party balances projection.
///
/// Rebuildable from ledger events. Tenant-isolated.
#[derive(Debug)]
pub struct PartyBalancesProjection<S>
where
    S: TenantStore<PartyRef, PartyBalance>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> PartyBalancesProjection<S>
where
    S: TenantStore<PartyRef, PartyBalance>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Cached balance for one party (O(1); no entry scan).
    pub fn get(&self, tenant_id: TenantId, party: &PartyRef) -> Option<PartyBalance> {
        self.store.get(tenant_id, party)
    }

    /// All party balances for a tenant.
    pub fn list(&self, tenant_id: TenantId) -> Vec<PartyBalance> {
        self.store.list(tenant_id)
    }

    /// Parties of one kind with a non-zero balance (statement candidates).
    pub fn list_outstanding(&self, tenant_id: TenantId, kind: PartyKind) -> Vec<PartyBalance> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(|b| b.party.kind == kind && b.balance != 0)
            .collect()
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), PartyBalanceProjectionError> {
        if envelope.aggregate_type() != "ledger.party" {
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
                return Err(PartyBalanceProjectionError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(PartyBalanceProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: LedgerEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| PartyBalanceProjectionError::Deserialize(e.to_string()))?;

            let event_tenant = match &event {
                LedgerEvent::EntryAppended(e) => e.tenant_id,
                LedgerEvent::EntryStatusChanged(e) => e.tenant_id,
                LedgerEvent::EntryDeleted(e) => e.tenant_id,
                LedgerEvent::LedgerRecalculated(e) => e.tenant_id,
            };
            if event_tenant != tenant_id {
                return Err(PartyBalanceProjectionError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }

            match event {
                LedgerEvent::EntryAppended(e) => {
                    self.store.upsert(
                        tenant_id,
                        e.party,
                        PartyBalance {
                            party: e.party,
                            balance: e.entry.balance,
                            updated_at: e.occurred_at,
                        },
                    );
                }
                LedgerEvent::LedgerRecalculated(e) => {
                    self.store.upsert(
                        tenant_id,
                        e.party,
                        PartyBalance {
                            party: e.party,
                            balance: e.balance,
                            updated_at: e.occurred_at,
                        },
                    );
                }
                // Status changes don't move money; deletions leave the cache
                // stale until the required recalculation lands.
                LedgerEvent::EntryStatusChanged(_) | LedgerEvent::EntryDeleted(_) => {}
            }

            cursors.insert(key, seq);
        }

        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), PartyBalanceProjectionError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use tillcore_core::{DocRef, DocumentKind};
    use tillcore_ledger::{
        EntryAppended, EntryBalance, EntryDeleted, EntryId, EntryKind, EntryStatus, LedgerEntry,
        LedgerRecalculated,
    };
    use tillcore_parties::PartyId;

    use crate::read_model::InMemoryTenantStore;

    fn make_envelope(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        seq: u64,
        event: LedgerEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            "ledger.party".to_string(),
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn receivable(party: PartyRef, id: EntryId, debit: i64, balance: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            party,
            location_id: None,
            kind: EntryKind::Receivable,
            source: DocRef::new(DocumentKind::Sale, Uuid::now_v7(), "INV-1"),
            debit,
            credit: 0,
            balance,
            description: String::new(),
            transaction_date: Utc::now(),
            due_date: None,
            payment_method: None,
            status: EntryStatus::Pending,
            created_by: None,
            deleted: false,
        }
    }

    fn test_party() -> PartyRef {
        PartyRef::customer(PartyId::new(tillcore_core::AggregateId::new()))
    }

    #[test]
    fn append_updates_cached_balance() {
        let proj = PartyBalancesProjection::new(Arc::new(InMemoryTenantStore::new()));
        let tenant_id = TenantId::new();
        let party = test_party();
        let stream = party.stream_id();

        let appended = LedgerEvent::EntryAppended(EntryAppended {
            tenant_id,
            party,
            entry: receivable(party, EntryId::new(), 900, 900),
            occurred_at: Utc::now(),
        });
        proj.apply_envelope(&make_envelope(tenant_id, stream, 1, appended))
            .unwrap();

        assert_eq!(proj.get(tenant_id, &party).unwrap().balance, 900);
        assert_eq!(proj.list_outstanding(tenant_id, PartyKind::Customer).len(), 1);
        assert!(proj.list_outstanding(tenant_id, PartyKind::Supplier).is_empty());
    }

    #[test]
    fn deletion_leaves_cache_stale_until_recalculation() {
        let proj = PartyBalancesProjection::new(Arc::new(InMemoryTenantStore::new()));
        let tenant_id = TenantId::new();
        let party = test_party();
        let stream = party.stream_id();
        let entry_id = EntryId::new();

        let appended = LedgerEvent::EntryAppended(EntryAppended {
            tenant_id,
            party,
            entry: receivable(party, entry_id, 500, 500),
            occurred_at: Utc::now(),
        });
        proj.apply_envelope(&make_envelope(tenant_id, stream, 1, appended))
            .unwrap();

        let deleted = LedgerEvent::EntryDeleted(EntryDeleted {
            tenant_id,
            party,
            entry_id,
            occurred_at: Utc::now(),
        });
        proj.apply_envelope(&make_envelope(tenant_id, stream, 2, deleted))
            .unwrap();
        // Stale on purpose.
        assert_eq!(proj.get(tenant_id, &party).unwrap().balance, 500);

        let recalculated = LedgerEvent::LedgerRecalculated(LedgerRecalculated {
            tenant_id,
            party,
            entry_balances: Vec::<EntryBalance>::new(),
            balance: 0,
            occurred_at: Utc::now(),
        });
        proj.apply_envelope(&make_envelope(tenant_id, stream, 3, recalculated))
            .unwrap();

        assert_eq!(proj.get(tenant_id, &party).unwrap().balance, 0);
        assert!(proj.list_outstanding(tenant_id, PartyKind::Customer).is_empty());
    }
}
