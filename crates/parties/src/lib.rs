//! Party references: the customer/supplier side of a ledger entry.
//!
//! Party master data (names, contacts, CRUD) lives outside the core; the
//! ledger only needs a typed reference to the owning party.

mod party;

pub use party::{PartyId, PartyKind, PartyRef};
