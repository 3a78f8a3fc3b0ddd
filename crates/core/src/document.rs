//! References to the business documents that cause domain changes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_object::ValueObject;

/// Kind of business document a ledger entry or stock movement originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Sale,
    Purchase,
    PurchaseReturn,
    Payment,
    Adjustment,
    Transfer,
    OpeningBalance,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Sale => "sale",
            DocumentKind::Purchase => "purchase",
            DocumentKind::PurchaseReturn => "purchase_return",
            DocumentKind::Payment => "payment",
            DocumentKind::Adjustment => "adjustment",
            DocumentKind::Transfer => "transfer",
            DocumentKind::OpeningBalance => "opening_balance",
        }
    }
}

/// Polymorphic reference to an originating business document.
///
/// Carries the document kind, its id, and the human-readable number printed
/// on receipts/statements (e.g. "INV-0042"). The tagged kind replaces
/// stringly-typed type names at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    pub kind: DocumentKind,
    pub doc_id: Uuid,
    pub number: String,
}

impl DocRef {
    pub fn new(kind: DocumentKind, doc_id: Uuid, number: impl Into<String>) -> Self {
        Self {
            kind,
            doc_id,
            number: number.into(),
        }
    }
}

impl ValueObject for DocRef {}

impl core::fmt::Display for DocRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.number)
    }
}
