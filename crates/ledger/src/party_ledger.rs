use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tillcore_core::{
    Aggregate, AggregateId, AggregateRoot, DocRef, DomainError, LocationId, TenantId, UserId,
};
use tillcore_events::Event;
use tillcore_parties::PartyRef;

use crate::entry::{EntryId, EntryKind, EntryStatus, LedgerEntry, PaymentMethod};

/// Grace period granted on credit sales before a receivable falls due.
pub const CREDIT_GRACE_DAYS: i64 = 30;

/// Ledger stream identifier: one stream per (party kind, party id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerStreamId(pub AggregateId);

impl LedgerStreamId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// Deterministic stream id for a party's ledger.
    pub fn for_party(party: PartyRef) -> Self {
        Self(party.stream_id())
    }
}

impl core::fmt::Display for LedgerStreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: PartyLedger, the financial history of one party.
///
/// The cached `balance` is written only when an entry is appended or when the
/// ledger is recalculated; no other code path read-modifies-writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyLedger {
    id: LedgerStreamId,
    tenant_id: Option<TenantId>,
    party: Option<PartyRef>,
    entries: Vec<LedgerEntry>,
    balance: i64,
    version: u64,
    created: bool,
}

impl PartyLedger {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: LedgerStreamId) -> Self {
        Self {
            id,
            tenant_id: None,
            party: None,
            entries: Vec::new(),
            balance: 0,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LedgerStreamId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn party(&self) -> Option<PartyRef> {
        self.party
    }

    /// Cached balance (O(1)); equals the most recent live entry's stored
    /// balance except between a deletion and the required recalculation.
    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn entry(&self, id: EntryId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Recompute the balance by replaying live entries in
    /// (transaction_date, id) order. Reconciliation/audit tooling only;
    /// steady-state reads use the cached value.
    pub fn replayed_balance(&self) -> i64 {
        let mut live: Vec<&LedgerEntry> = self.entries.iter().filter(|e| e.is_live()).collect();
        live.sort_by_key(|e| (e.transaction_date, e.id));
        live.iter().map(|e| e.signed_amount()).sum()
    }

    /// Balance of the most recent live entry by (transaction_date, id), or
    /// zero for a fresh ledger. This is the base every append builds on.
    fn current_balance(&self) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.is_live())
            .max_by_key(|e| (e.transaction_date, e.id))
            .map(|e| e.balance)
            .unwrap_or(0)
    }
}

/// Command: AppendEntry, the one sanctioned way to add financial history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntry {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub location_id: Option<LocationId>,
    pub kind: EntryKind,
    pub source: DocRef,
    pub debit: i64,
    pub credit: i64,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub payment_method: Option<PaymentMethod>,
    pub created_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordSale, a business rule layered on AppendEntry.
///
/// Decides a single receivable for deferred (credit) sales and **zero events**
/// for settled sales: the ledger tracks outstanding balances, not cash that
/// already changed hands. Callers must not treat the empty decision as an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSale {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub location_id: Option<LocationId>,
    pub sale: DocRef,
    pub total: i64,
    pub payment_method: PaymentMethod,
    pub transaction_date: DateTime<Utc>,
    pub created_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub location_id: Option<LocationId>,
    pub source: DocRef,
    pub amount: i64,
    pub method: PaymentMethod,
    /// Instrument reference (cheque number, UTR, ...).
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub transaction_date: DateTime<Utc>,
    pub created_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordOpeningBalance. Signed carry-over from a previous system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOpeningBalance {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub source: DocRef,
    /// Positive: the party owes us; negative: we owe the party.
    pub amount: i64,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    pub created_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOverdue. Sweeps pending receivables past their due date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOverdue {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub as_of: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SettleEntry. Marks a receivable completed once paid in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleEntry {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelEntry. Manual transition to the cancelled terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelEntry {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteEntry. Soft delete for reconciliation tooling.
///
/// Leaves later stored balances stale; `Recalculate` must follow before the
/// ledger is read again for balance purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntry {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Recalculate. Full deterministic replay repairing every stored
/// balance and the cached party balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recalculate {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    AppendEntry(AppendEntry),
    RecordSale(RecordSale),
    RecordPayment(RecordPayment),
    RecordOpeningBalance(RecordOpeningBalance),
    MarkOverdue(MarkOverdue),
    SettleEntry(SettleEntry),
    CancelEntry(CancelEntry),
    DeleteEntry(DeleteEntry),
    Recalculate(Recalculate),
}

/// Event: EntryAppended carries the fully-priced entry, balance included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAppended {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry: LedgerEntry,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EntryStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatusChanged {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub from: EntryStatus,
    pub to: EntryStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EntryDeleted (soft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDeleted {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Corrected stored balance for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBalance {
    pub entry_id: EntryId,
    pub balance: i64,
}

/// Event: LedgerRecalculated carries the corrected balance vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecalculated {
    pub tenant_id: TenantId,
    pub party: PartyRef,
    pub entry_balances: Vec<EntryBalance>,
    pub balance: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    EntryAppended(EntryAppended),
    EntryStatusChanged(EntryStatusChanged),
    EntryDeleted(EntryDeleted),
    LedgerRecalculated(LedgerRecalculated),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::EntryAppended(_) => "ledger.party.entry_appended",
            LedgerEvent::EntryStatusChanged(_) => "ledger.party.entry_status_changed",
            LedgerEvent::EntryDeleted(_) => "ledger.party.entry_deleted",
            LedgerEvent::LedgerRecalculated(_) => "ledger.party.recalculated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::EntryAppended(e) => e.occurred_at,
            LedgerEvent::EntryStatusChanged(e) => e.occurred_at,
            LedgerEvent::EntryDeleted(e) => e.occurred_at,
            LedgerEvent::LedgerRecalculated(e) => e.occurred_at,
        }
    }
}

impl AggregateRoot for PartyLedger {
    type Id = LedgerStreamId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for PartyLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::EntryAppended(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.party = Some(e.party);
                self.created = true;
                self.balance = e.entry.balance;
                self.entries.push(e.entry.clone());
            }
            LedgerEvent::EntryStatusChanged(e) => {
                if let Some(entry) = self.entries.iter_mut().find(|x| x.id == e.entry_id) {
                    entry.status = e.to;
                }
            }
            LedgerEvent::EntryDeleted(e) => {
                // Stored balances of later entries are stale from here until
                // a LedgerRecalculated event lands; the cached balance is
                // deliberately left untouched as well.
                if let Some(entry) = self.entries.iter_mut().find(|x| x.id == e.entry_id) {
                    entry.deleted = true;
                }
            }
            LedgerEvent::LedgerRecalculated(e) => {
                for eb in &e.entry_balances {
                    if let Some(entry) = self.entries.iter_mut().find(|x| x.id == eb.entry_id) {
                        entry.balance = eb.balance;
                    }
                }
                self.balance = e.balance;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::AppendEntry(cmd) => self.handle_append(cmd),
            LedgerCommand::RecordSale(cmd) => self.handle_record_sale(cmd),
            LedgerCommand::RecordPayment(cmd) => self.handle_record_payment(cmd),
            LedgerCommand::RecordOpeningBalance(cmd) => self.handle_opening_balance(cmd),
            LedgerCommand::MarkOverdue(cmd) => self.handle_mark_overdue(cmd),
            LedgerCommand::SettleEntry(cmd) => self.handle_settle(cmd),
            LedgerCommand::CancelEntry(cmd) => self.handle_cancel(cmd),
            LedgerCommand::DeleteEntry(cmd) => self.handle_delete(cmd),
            LedgerCommand::Recalculate(cmd) => self.handle_recalculate(cmd),
        }
    }
}

impl PartyLedger {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_party(&self, party: PartyRef) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.party != Some(party) {
            return Err(DomainError::invariant("party mismatch for stream"));
        }
        Ok(())
    }

    fn validate_amounts(kind: EntryKind, debit: i64, credit: i64) -> Result<(), DomainError> {
        if kind == EntryKind::Adjustment {
            // Adjustments carry a signed value in the debit field.
            if credit != 0 {
                return Err(DomainError::validation(
                    "adjustment entries carry their signed amount in debit",
                ));
            }
            if debit == 0 {
                return Err(DomainError::validation("adjustment amount cannot be zero"));
            }
            return Ok(());
        }

        if debit < 0 || credit < 0 {
            return Err(DomainError::validation("amounts must be non-negative"));
        }
        if (debit == 0) == (credit == 0) {
            return Err(DomainError::validation(
                "exactly one of debit/credit must be non-zero",
            ));
        }
        Ok(())
    }

    fn build_entry(&self, cmd: &AppendEntry, status: EntryStatus) -> LedgerEntry {
        LedgerEntry {
            id: cmd.entry_id,
            party: cmd.party,
            location_id: cmd.location_id,
            kind: cmd.kind,
            source: cmd.source.clone(),
            debit: cmd.debit,
            credit: cmd.credit,
            balance: self.current_balance() + cmd.debit - cmd.credit,
            description: cmd.description.clone(),
            transaction_date: cmd.transaction_date,
            due_date: cmd.due_date,
            payment_method: cmd.payment_method,
            status,
            created_by: cmd.created_by,
            deleted: false,
        }
    }

    fn handle_append(&self, cmd: &AppendEntry) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        Self::validate_amounts(cmd.kind, cmd.debit, cmd.credit)?;
        if self.entries.iter().any(|e| e.id == cmd.entry_id) {
            return Err(DomainError::conflict("entry already exists"));
        }
        if cmd.due_date.is_some() && cmd.kind != EntryKind::Receivable {
            return Err(DomainError::validation("only receivables carry a due date"));
        }

        let status = match cmd.kind {
            EntryKind::Receivable => EntryStatus::Pending,
            _ => EntryStatus::Completed,
        };

        Ok(vec![LedgerEvent::EntryAppended(EntryAppended {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry: self.build_entry(cmd, status),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_sale(&self, cmd: &RecordSale) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        if cmd.total <= 0 {
            return Err(DomainError::validation("sale total must be positive"));
        }

        // Settled sales leave no trace here: no outstanding amount, no entry.
        if !cmd.payment_method.is_deferred() {
            return Ok(vec![]);
        }

        let append = AppendEntry {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            location_id: cmd.location_id,
            kind: EntryKind::Receivable,
            source: cmd.sale.clone(),
            debit: cmd.total,
            credit: 0,
            description: format!("Credit sale {}", cmd.sale.number),
            transaction_date: cmd.transaction_date,
            due_date: Some(cmd.transaction_date + Duration::days(CREDIT_GRACE_DAYS)),
            payment_method: Some(cmd.payment_method),
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        };
        self.handle_append(&append)
    }

    fn handle_record_payment(&self, cmd: &RecordPayment) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        if cmd.amount <= 0 {
            return Err(DomainError::validation("payment amount must be positive"));
        }

        let description = match (&cmd.reference, &cmd.notes) {
            (Some(r), Some(n)) => format!("Payment {r}: {n}"),
            (Some(r), None) => format!("Payment {r}"),
            (None, Some(n)) => format!("Payment: {n}"),
            (None, None) => "Payment".to_string(),
        };

        let append = AppendEntry {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            location_id: cmd.location_id,
            kind: EntryKind::Payment,
            source: cmd.source.clone(),
            debit: 0,
            credit: cmd.amount,
            description,
            transaction_date: cmd.transaction_date,
            due_date: None,
            payment_method: Some(cmd.method),
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        };
        self.handle_append(&append)
    }

    fn handle_opening_balance(
        &self,
        cmd: &RecordOpeningBalance,
    ) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        if cmd.amount == 0 {
            return Err(DomainError::validation("opening balance cannot be zero"));
        }
        if self.entries.iter().any(|e| e.kind == EntryKind::OpeningBalance && e.is_live()) {
            return Err(DomainError::conflict("opening balance already recorded"));
        }

        let (debit, credit) = if cmd.amount > 0 {
            (cmd.amount, 0)
        } else {
            (0, -cmd.amount)
        };

        let append = AppendEntry {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            location_id: None,
            kind: EntryKind::OpeningBalance,
            source: cmd.source.clone(),
            debit,
            credit,
            description: cmd.description.clone(),
            transaction_date: cmd.transaction_date,
            due_date: None,
            payment_method: None,
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        };
        self.handle_append(&append)
    }

    fn handle_mark_overdue(&self, cmd: &MarkOverdue) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        let events = self
            .entries
            .iter()
            .filter(|e| {
                e.is_live()
                    && e.status == EntryStatus::Pending
                    && e.due_date.is_some_and(|due| due < cmd.as_of)
            })
            .map(|e| {
                LedgerEvent::EntryStatusChanged(EntryStatusChanged {
                    tenant_id: cmd.tenant_id,
                    party: cmd.party,
                    entry_id: e.id,
                    from: EntryStatus::Pending,
                    to: EntryStatus::Overdue,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect();

        Ok(events)
    }

    fn handle_settle(&self, cmd: &SettleEntry) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        let entry = self
            .entries
            .iter()
            .find(|e| e.id == cmd.entry_id && e.is_live())
            .ok_or(DomainError::NotFound)?;

        match entry.status {
            EntryStatus::Pending | EntryStatus::Overdue => {}
            EntryStatus::Completed | EntryStatus::Cancelled => {
                return Err(DomainError::invariant(
                    "completed and cancelled entries are terminal",
                ));
            }
        }

        Ok(vec![LedgerEvent::EntryStatusChanged(EntryStatusChanged {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            from: entry.status,
            to: EntryStatus::Completed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelEntry) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        let entry = self
            .entries
            .iter()
            .find(|e| e.id == cmd.entry_id && e.is_live())
            .ok_or(DomainError::NotFound)?;

        match entry.status {
            EntryStatus::Pending | EntryStatus::Overdue => {}
            EntryStatus::Completed | EntryStatus::Cancelled => {
                return Err(DomainError::invariant(
                    "completed and cancelled entries are terminal",
                ));
            }
        }

        Ok(vec![LedgerEvent::EntryStatusChanged(EntryStatusChanged {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            from: entry.status,
            to: EntryStatus::Cancelled,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteEntry) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        if !self.entries.iter().any(|e| e.id == cmd.entry_id && e.is_live()) {
            return Err(DomainError::NotFound);
        }

        Ok(vec![LedgerEvent::EntryDeleted(EntryDeleted {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_id: cmd.entry_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_recalculate(&self, cmd: &Recalculate) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_party(cmd.party)?;

        let mut live: Vec<&LedgerEntry> = self.entries.iter().filter(|e| e.is_live()).collect();
        live.sort_by_key(|e| (e.transaction_date, e.id));

        let mut running = 0i64;
        let mut entry_balances = Vec::with_capacity(live.len());
        for entry in live {
            running += entry.signed_amount();
            entry_balances.push(EntryBalance {
                entry_id: entry.id,
                balance: running,
            });
        }

        Ok(vec![LedgerEvent::LedgerRecalculated(LedgerRecalculated {
            tenant_id: cmd.tenant_id,
            party: cmd.party,
            entry_balances,
            balance: running,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tillcore_core::DocumentKind;
    use tillcore_parties::PartyId;
    use uuid::Uuid;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_customer() -> PartyRef {
        PartyRef::customer(PartyId::new(AggregateId::new()))
    }

    fn test_supplier() -> PartyRef {
        PartyRef::supplier(PartyId::new(AggregateId::new()))
    }

    fn sale_ref(number: &str) -> DocRef {
        DocRef::new(DocumentKind::Sale, Uuid::now_v7(), number)
    }

    fn payment_ref(number: &str) -> DocRef {
        DocRef::new(DocumentKind::Payment, Uuid::now_v7(), number)
    }

    fn apply_all(ledger: &mut PartyLedger, events: &[LedgerEvent]) {
        for e in events {
            ledger.apply(e);
        }
    }

    fn record_credit_sale(
        ledger: &mut PartyLedger,
        tenant_id: TenantId,
        party: PartyRef,
        total: i64,
        at: DateTime<Utc>,
    ) -> EntryId {
        let entry_id = EntryId::new();
        let cmd = RecordSale {
            tenant_id,
            party,
            entry_id,
            location_id: None,
            sale: sale_ref("INV-1"),
            total,
            payment_method: PaymentMethod::Credit,
            transaction_date: at,
            created_by: None,
            occurred_at: at,
        };
        let events = ledger.handle(&LedgerCommand::RecordSale(cmd)).unwrap();
        apply_all(ledger, &events);
        entry_id
    }

    #[test]
    fn cash_sale_decides_no_events() {
        let party = test_customer();
        let ledger = PartyLedger::empty(LedgerStreamId::for_party(party));

        let cmd = RecordSale {
            tenant_id: test_tenant_id(),
            party,
            entry_id: EntryId::new(),
            location_id: None,
            sale: sale_ref("INV-9"),
            total: 12_500,
            payment_method: PaymentMethod::Cash,
            transaction_date: Utc::now(),
            created_by: None,
            occurred_at: Utc::now(),
        };

        let events = ledger.handle(&LedgerCommand::RecordSale(cmd)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn credit_sale_decides_exactly_one_pending_receivable() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        let cmd = RecordSale {
            tenant_id,
            party,
            entry_id: EntryId::new(),
            location_id: None,
            sale: sale_ref("INV-10"),
            total: 9_000,
            payment_method: PaymentMethod::Credit,
            transaction_date: when,
            created_by: None,
            occurred_at: when,
        };

        let events = ledger.handle(&LedgerCommand::RecordSale(cmd)).unwrap();
        assert_eq!(events.len(), 1);
        let LedgerEvent::EntryAppended(e) = &events[0] else {
            panic!("Expected EntryAppended event");
        };
        assert_eq!(e.entry.kind, EntryKind::Receivable);
        assert_eq!(e.entry.debit, 9_000);
        assert_eq!(e.entry.credit, 0);
        assert_eq!(e.entry.balance, 9_000);
        assert_eq!(e.entry.status, EntryStatus::Pending);
        assert_eq!(
            e.entry.due_date,
            Some(when + Duration::days(CREDIT_GRACE_DAYS))
        );
    }

    #[test]
    fn payment_reduces_running_balance() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        record_credit_sale(&mut ledger, tenant_id, party, 10_000, when);
        assert_eq!(ledger.balance(), 10_000);

        let cmd = RecordPayment {
            tenant_id,
            party,
            entry_id: EntryId::new(),
            location_id: None,
            source: payment_ref("PAY-1"),
            amount: 4_000,
            method: PaymentMethod::Upi,
            reference: Some("UTR-778".to_string()),
            notes: None,
            transaction_date: when + Duration::days(1),
            created_by: None,
            occurred_at: when + Duration::days(1),
        };
        let events = ledger.handle(&LedgerCommand::RecordPayment(cmd)).unwrap();
        apply_all(&mut ledger, &events);

        assert_eq!(ledger.balance(), 6_000);
        let last = ledger.entries().last().unwrap();
        assert_eq!(last.kind, EntryKind::Payment);
        assert_eq!(last.credit, 4_000);
        assert_eq!(last.balance, 6_000);
        assert_eq!(last.status, EntryStatus::Completed);
        assert_eq!(last.due_date, None);
    }

    #[test]
    fn non_adjustment_entries_must_be_single_sided() {
        let party = test_supplier();
        let ledger = PartyLedger::empty(LedgerStreamId::for_party(party));

        let cmd = AppendEntry {
            tenant_id: test_tenant_id(),
            party,
            entry_id: EntryId::new(),
            location_id: None,
            kind: EntryKind::DebitNote,
            source: DocRef::new(DocumentKind::Purchase, Uuid::now_v7(), "PO-2"),
            debit: 100,
            credit: 100,
            description: "both sides".to_string(),
            transaction_date: Utc::now(),
            due_date: None,
            payment_method: None,
            created_by: None,
            occurred_at: Utc::now(),
        };

        let err = ledger.handle(&LedgerCommand::AppendEntry(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn adjustment_may_carry_a_negative_amount() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        record_credit_sale(&mut ledger, tenant_id, party, 5_000, when);

        let cmd = AppendEntry {
            tenant_id,
            party,
            entry_id: EntryId::new(),
            location_id: None,
            kind: EntryKind::Adjustment,
            source: DocRef::new(DocumentKind::Adjustment, Uuid::now_v7(), "ADJ-1"),
            debit: -1_500,
            credit: 0,
            description: "billing correction".to_string(),
            transaction_date: when + Duration::days(1),
            due_date: None,
            payment_method: None,
            created_by: None,
            occurred_at: when + Duration::days(1),
        };
        let events = ledger.handle(&LedgerCommand::AppendEntry(cmd)).unwrap();
        apply_all(&mut ledger, &events);

        assert_eq!(ledger.balance(), 3_500);
    }

    #[test]
    fn overdue_sweep_only_touches_past_due_pending_entries() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        let old = record_credit_sale(&mut ledger, tenant_id, party, 1_000, when);
        let recent = record_credit_sale(
            &mut ledger,
            tenant_id,
            party,
            2_000,
            when + Duration::days(20),
        );

        let cmd = MarkOverdue {
            tenant_id,
            party,
            as_of: when + Duration::days(CREDIT_GRACE_DAYS + 5),
            occurred_at: when + Duration::days(CREDIT_GRACE_DAYS + 5),
        };
        let events = ledger.handle(&LedgerCommand::MarkOverdue(cmd)).unwrap();
        assert_eq!(events.len(), 1);
        apply_all(&mut ledger, &events);

        assert_eq!(ledger.entry(old).unwrap().status, EntryStatus::Overdue);
        assert_eq!(ledger.entry(recent).unwrap().status, EntryStatus::Pending);
    }

    #[test]
    fn settling_a_receivable_is_terminal() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));

        let entry_id = record_credit_sale(&mut ledger, tenant_id, party, 1_000, Utc::now());

        let settle = SettleEntry {
            tenant_id,
            party,
            entry_id,
            occurred_at: Utc::now(),
        };
        let events = ledger
            .handle(&LedgerCommand::SettleEntry(settle.clone()))
            .unwrap();
        apply_all(&mut ledger, &events);
        assert_eq!(ledger.entry(entry_id).unwrap().status, EntryStatus::Completed);

        // Completed is terminal: neither settle nor cancel may touch it again.
        let err = ledger
            .handle(&LedgerCommand::SettleEntry(settle))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let cancel = CancelEntry {
            tenant_id,
            party,
            entry_id,
            occurred_at: Utc::now(),
        };
        let err = ledger.handle(&LedgerCommand::CancelEntry(cancel)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn delete_leaves_balance_stale_until_recalculation() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        let first = record_credit_sale(&mut ledger, tenant_id, party, 1_000, when);
        record_credit_sale(&mut ledger, tenant_id, party, 2_000, when + Duration::days(1));
        assert_eq!(ledger.balance(), 3_000);

        let delete = DeleteEntry {
            tenant_id,
            party,
            entry_id: first,
            occurred_at: Utc::now(),
        };
        let events = ledger.handle(&LedgerCommand::DeleteEntry(delete)).unwrap();
        apply_all(&mut ledger, &events);

        // Cached balance and the survivor's stored balance are stale on purpose.
        assert_eq!(ledger.balance(), 3_000);
        assert_eq!(ledger.replayed_balance(), 2_000);

        let recalc = Recalculate {
            tenant_id,
            party,
            occurred_at: Utc::now(),
        };
        let events = ledger.handle(&LedgerCommand::Recalculate(recalc)).unwrap();
        apply_all(&mut ledger, &events);

        assert_eq!(ledger.balance(), 2_000);
        let survivor = ledger.entries().iter().find(|e| e.is_live()).unwrap();
        assert_eq!(survivor.balance, 2_000);
    }

    #[test]
    fn backdated_append_builds_on_latest_dated_entry_until_recalculated() {
        let party = test_customer();
        let tenant_id = test_tenant_id();
        let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
        let when = Utc::now();

        record_credit_sale(&mut ledger, tenant_id, party, 1_000, when);

        // Backdated entry: prior balance comes from the latest entry by
        // (transaction_date, id), not from append order.
        let cmd = AppendEntry {
            tenant_id,
            party,
            entry_id: EntryId::new(),
            location_id: None,
            kind: EntryKind::DebitNote,
            source: DocRef::new(DocumentKind::Purchase, Uuid::now_v7(), "PO-5"),
            debit: 500,
            credit: 0,
            description: "backdated".to_string(),
            transaction_date: when - Duration::days(10),
            due_date: None,
            payment_method: None,
            created_by: None,
            occurred_at: Utc::now(),
        };
        let events = ledger.handle(&LedgerCommand::AppendEntry(cmd)).unwrap();
        apply_all(&mut ledger, &events);
        assert_eq!(ledger.balance(), 1_500);

        // Replay in date order now disagrees with the first entry's stored
        // balance; recalculation restores the invariant.
        let recalc = Recalculate {
            tenant_id,
            party,
            occurred_at: Utc::now(),
        };
        let events = ledger.handle(&LedgerCommand::Recalculate(recalc)).unwrap();
        apply_all(&mut ledger, &events);

        assert_eq!(ledger.balance(), 1_500);
        let mut live: Vec<_> = ledger.entries().iter().filter(|e| e.is_live()).collect();
        live.sort_by_key(|e| (e.transaction_date, e.id));
        assert_eq!(live[0].balance, 500);
        assert_eq!(live[1].balance, 1_500);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any interleaving of credit sales and payments, the
        /// cached balance equals the replayed sum of debits minus credits,
        /// and equals the last live entry's stored balance.
        #[test]
        fn cached_balance_equals_replay(
            ops in prop::collection::vec((prop::bool::ANY, 1i64..100_000), 1..20)
        ) {
            let party = test_customer();
            let tenant_id = test_tenant_id();
            let mut ledger = PartyLedger::empty(LedgerStreamId::for_party(party));
            let start = Utc::now();

            for (i, (is_sale, amount)) in ops.iter().enumerate() {
                let at = start + Duration::minutes(i as i64);
                let command = if *is_sale {
                    LedgerCommand::RecordSale(RecordSale {
                        tenant_id,
                        party,
                        entry_id: EntryId::new(),
                        location_id: None,
                        sale: sale_ref("INV-P"),
                        total: *amount,
                        payment_method: PaymentMethod::Credit,
                        transaction_date: at,
                        created_by: None,
                        occurred_at: at,
                    })
                } else {
                    LedgerCommand::RecordPayment(RecordPayment {
                        tenant_id,
                        party,
                        entry_id: EntryId::new(),
                        location_id: None,
                        source: payment_ref("PAY-P"),
                        amount: *amount,
                        method: PaymentMethod::Cash,
                        reference: None,
                        notes: None,
                        transaction_date: at,
                        created_by: None,
                        occurred_at: at,
                    })
                };

                let events = ledger.handle(&command).unwrap();
                for e in &events {
                    ledger.apply(e);
                }
            }

            prop_assert_eq!(ledger.balance(), ledger.replayed_balance());

            let mut live: Vec<_> = ledger.entries().iter().filter(|e| e.is_live()).collect();
            live.sort_by_key(|e| (e.transaction_date, e.id));
            if let Some(last) = live.last() {
                prop_assert_eq!(last.balance, ledger.balance());
            }
        }
    }
}
