use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tillcore_core::{DocRef, Entity, LocationId, UserId};
use tillcore_parties::PartyRef;

/// Ledger entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Fresh time-ordered id. Prefer passing ids explicitly in tests.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Financial meaning of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Money a customer owes (credit sale).
    Receivable,
    /// Money received from (or paid to) the party.
    Payment,
    /// Reduces what is owed (e.g. purchase return to a supplier).
    CreditNote,
    /// Increases what is owed (e.g. goods received from a supplier).
    DebitNote,
    /// Manual correction; the only kind allowed to carry a signed amount.
    Adjustment,
    OpeningBalance,
}

/// Entry status lifecycle.
///
/// `Pending` (receivable awaiting payment) moves to `Completed`, `Overdue`
/// (due date passed) or `Cancelled`. Completed and cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Cancelled,
    Overdue,
}

/// How a sale or payment was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    BankTransfer,
    Cheque,
    /// Deferred payment; the only method that produces a receivable.
    Credit,
}

impl PaymentMethod {
    pub fn is_deferred(&self) -> bool {
        matches!(self, PaymentMethod::Credit)
    }
}

/// One row of financial history for a party.
///
/// Amounts are in the smallest currency unit. `balance` is the running total
/// of `debit - credit` over all non-deleted entries for the party ordered by
/// (transaction_date, id), up to and including this entry. Amounts are never
/// edited once later entries exist; corrections go through adjustment entries
/// or a full recalculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub party: PartyRef,
    pub location_id: Option<LocationId>,
    pub kind: EntryKind,
    /// Originating business document (type + id + human-readable number).
    pub source: DocRef,
    pub debit: i64,
    pub credit: i64,
    /// Running balance after this entry.
    pub balance: i64,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    /// Only receivables carry a due date.
    pub due_date: Option<DateTime<Utc>>,
    pub payment_method: Option<PaymentMethod>,
    pub status: EntryStatus,
    pub created_by: Option<UserId>,
    /// Soft-delete marker set by reconciliation tooling; a recalculation is
    /// required afterwards.
    pub deleted: bool,
}

impl Entity for LedgerEntry {
    type Id = EntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl LedgerEntry {
    /// Net effect of this entry on the party balance.
    pub fn signed_amount(&self) -> i64 {
        self.debit - self.credit
    }

    /// Whether this entry still counts toward the running balance.
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}
