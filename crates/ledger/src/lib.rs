//! Per-party financial ledger: append-only entries with a running balance.

mod entry;
mod party_ledger;

pub use entry::{EntryId, EntryKind, EntryStatus, LedgerEntry, PaymentMethod};
pub use party_ledger::{
    AppendEntry, CancelEntry, DeleteEntry, EntryAppended, EntryBalance, EntryDeleted,
    EntryStatusChanged, LedgerCommand, LedgerEvent, LedgerRecalculated, LedgerStreamId,
    MarkOverdue, PartyLedger, Recalculate, RecordOpeningBalance, RecordPayment, RecordSale,
    SettleEntry, CREDIT_GRACE_DAYS,
};
