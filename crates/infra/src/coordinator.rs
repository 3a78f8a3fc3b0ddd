//! Multi-aggregate business operations.
//!
//! The coordinator composes stock, ledger and purchasing aggregates into the
//! operations a POS terminal actually performs: process a sale, receive a
//! purchase, process a supplier return, record payments, transfer stock.
//!
//! Every operation follows the same unit-of-work shape:
//!
//! 1. load + rehydrate each aggregate involved,
//! 2. run the pure command handlers, collecting decided events per stream,
//! 3. commit all streams in one atomic `append_multi` (all-or-nothing),
//! 4. publish the committed events to the bus,
//! 5. on an optimistic-concurrency conflict, retry the whole operation from
//!    a fresh read, a bounded number of times.
//!
//! Because nothing is persisted until step 3, a validation failure or an
//! allocation shortfall on any line leaves zero movements, zero batch
//! mutations and zero ledger entries behind.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use tillcore_core::{
    Aggregate, AggregateId, DocRef, DocumentKind, ExpectedVersion, ItemId, LocationId, TenantId,
    UserId,
};
use tillcore_events::{EventBus, EventEnvelope};
use tillcore_ledger::{
    AppendEntry, EntryId, EntryKind, LedgerCommand, LedgerEntry, LedgerEvent, LedgerStreamId,
    PartyLedger, PaymentMethod, RecordPayment, RecordSale,
};
use tillcore_parties::{PartyId, PartyRef};
use tillcore_purchasing::{
    LineReceipt, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent, PurchaseOrderId,
    PurchaseStatus, PaymentStatus, ReceiveLines, RecordReturn, RegisterPayment, ReturnLine,
    ReturnRecord,
};
use tillcore_stock::{
    AllocateConsumption, AllocateReturn, BatchAllocation, BatchId, ConsumptionKind, ItemStock,
    ReceiptKind, ReceiveBatch, StockCommand, StockEvent, StockStreamId,
};

use crate::dispatcher::{DispatchError, apply_history, stream_version, validate_loaded_stream};
use crate::event_store::{EventStore, StreamAppend, UncommittedEvent};

/// How many times a whole operation is re-run after an optimistic-concurrency
/// conflict before the failure is surfaced.
const MAX_CONFLICT_RETRIES: u32 = 3;

const STOCK_AGGREGATE_TYPE: &str = "stock.item";
const LEDGER_AGGREGATE_TYPE: &str = "ledger.party";
const PURCHASE_AGGREGATE_TYPE: &str = "purchasing.order";

/// One line of an incoming sale document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleLine {
    pub item_id: ItemId,
    pub quantity: i64,
    /// Unit price in smallest currency unit.
    pub unit_price: i64,
}

/// Sale document handed in by the surrounding application (external input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleDocument {
    pub id: Uuid,
    pub number: String,
    pub lines: Vec<SaleLine>,
    pub payment_method: PaymentMethod,
    pub total_amount: i64,
    pub customer_id: Option<PartyId>,
    pub location_id: LocationId,
    pub created_at: DateTime<Utc>,
}

impl SaleDocument {
    fn doc_ref(&self) -> DocRef {
        DocRef::new(DocumentKind::Sale, self.id, self.number.clone())
    }
}

/// Per-line result of a sale allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAllocation {
    pub item_id: ItemId,
    pub quantity: i64,
    pub allocations: Vec<BatchAllocation>,
}

/// Result of `process_sale`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleOutcome {
    pub allocations: Vec<LineAllocation>,
    /// Present only for credit sales; settled sales leave no ledger trace.
    pub ledger_entry: Option<LedgerEntry>,
}

/// Result of `receive_purchase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub batch_ids: Vec<BatchId>,
    pub status: PurchaseStatus,
    /// Absent when the order was already fully paid.
    pub ledger_entry: Option<LedgerEntry>,
}

/// Result of `process_return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnOutcome {
    pub return_no: String,
    pub records: Vec<ReturnRecord>,
    pub ledger_entry: LedgerEntry,
}

/// Result of `record_purchase_payment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub ledger_entry: LedgerEntry,
    pub payment_status: PaymentStatus,
}

/// Result of `transfer_stock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Fresh batch created at the destination (batch identity is not
    /// preserved across locations).
    pub destination_batch_id: BatchId,
    pub quantity: i64,
}

/// Orchestrates atomic business operations across stock, ledger and
/// purchasing aggregates.
#[derive(Debug)]
pub struct TransactionCoordinator<S, B> {
    store: S,
    bus: B,
}

impl<S, B> TransactionCoordinator<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> TransactionCoordinator<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Process one sale: FIFO-allocate every line, then record the ledger
    /// effect (credit sales only). One atomic unit; a shortfall on any line
    /// rolls back everything.
    pub fn process_sale(
        &self,
        tenant_id: TenantId,
        sale: &SaleDocument,
        actor: Option<UserId>,
    ) -> Result<SaleOutcome, DispatchError> {
        if sale.lines.is_empty() {
            return Err(DispatchError::Validation("sale has no lines".to_string()));
        }
        let computed: i64 = sale.lines.iter().map(|l| l.quantity * l.unit_price).sum();
        if computed != sale.total_amount {
            return Err(DispatchError::Validation(format!(
                "sale total {} does not match line total {computed}",
                sale.total_amount
            )));
        }
        if sale.payment_method.is_deferred() && sale.customer_id.is_none() {
            return Err(DispatchError::Validation(
                "credit sale requires a customer".to_string(),
            ));
        }

        self.with_conflict_retry("process_sale", || {
            let mut stock = StockSession::new(&self.store, tenant_id, sale.location_id);

            let mut line_allocations = Vec::with_capacity(sale.lines.len());
            for line in &sale.lines {
                let events = stock.run(
                    line.item_id,
                    StockCommand::AllocateConsumption(AllocateConsumption {
                        tenant_id,
                        item_id: line.item_id,
                        location_id: sale.location_id,
                        kind: ConsumptionKind::Sale,
                        quantity: line.quantity,
                        source: sale.doc_ref(),
                        actor,
                        occurred_at: sale.created_at,
                    }),
                )?;
                line_allocations.push(LineAllocation {
                    item_id: line.item_id,
                    quantity: line.quantity,
                    allocations: consumed_allocations(&events),
                });
            }

            let mut batches = stock.into_stream_appends()?;

            // The ledger decides zero events for settled sales; None means
            // "no outstanding amount", not failure.
            let mut ledger_entry = None;
            if let Some(customer_id) = sale.customer_id {
                let party = PartyRef::customer(customer_id);
                let (ledger, version) = self.load_ledger(tenant_id, party)?;
                let events = ledger
                    .handle(&LedgerCommand::RecordSale(RecordSale {
                        tenant_id,
                        party,
                        entry_id: EntryId::new(),
                        location_id: Some(sale.location_id),
                        sale: sale.doc_ref(),
                        total: sale.total_amount,
                        payment_method: sale.payment_method,
                        transaction_date: sale.created_at,
                        created_by: actor,
                        occurred_at: sale.created_at,
                    }))
                    .map_err(DispatchError::from)?;
                ledger_entry = appended_entry(&events);
                batches.push(staged(
                    tenant_id,
                    party.stream_id(),
                    LEDGER_AGGREGATE_TYPE,
                    &events,
                    version,
                )?);
            }

            self.commit_and_publish(batches)?;
            debug!(sale = %sale.number, lines = line_allocations.len(), "sale processed");

            Ok(SaleOutcome {
                allocations: line_allocations,
                ledger_entry,
            })
        })
    }

    /// Receive goods against a purchase order: one fresh batch per received
    /// line, purchase bookkeeping rolled forward, and the supplier ledger
    /// debited for the received value (unless the order is already paid).
    ///
    /// `quantities` limits the receive to specific lines; `None` receives
    /// every outstanding line in full.
    pub fn receive_purchase(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        quantities: Option<Vec<LineReceipt>>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, DispatchError> {
        self.with_conflict_retry("receive_purchase", || {
            let (order, order_version) = self.load_purchase(tenant_id, order_id)?;

            let receipts = match &quantities {
                Some(q) => q.clone(),
                None => order
                    .lines()
                    .iter()
                    .filter(|l| l.outstanding() > 0)
                    .map(|l| LineReceipt {
                        line_no: l.line_no,
                        quantity: l.outstanding(),
                    })
                    .collect(),
            };

            let order_events = order
                .handle(&PurchaseOrderCommand::ReceiveLines(ReceiveLines {
                    tenant_id,
                    order_id,
                    receipts: receipts.clone(),
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let new_status = match &order_events[..] {
                [PurchaseOrderEvent::LinesReceived(e)] => e.new_status,
                _ => order.status(),
            };

            let location_id = order
                .location_id()
                .ok_or_else(|| DispatchError::Validation("order has no location".to_string()))?;
            let supplier_id = order
                .supplier_id()
                .ok_or_else(|| DispatchError::Validation("order has no supplier".to_string()))?;
            let purchase_ref = DocRef::new(
                DocumentKind::Purchase,
                *order_id.0.as_uuid(),
                order.number().to_string(),
            );

            let mut stock = StockSession::new(&self.store, tenant_id, location_id);
            let mut batch_ids = Vec::with_capacity(receipts.len());
            let mut received_value = 0i64;
            for receipt in &receipts {
                let line = order.line(receipt.line_no).ok_or_else(|| {
                    DispatchError::Validation(format!("unknown line {}", receipt.line_no))
                })?;
                let batch_id = BatchId::new();
                stock.run(
                    line.item_id,
                    StockCommand::ReceiveBatch(ReceiveBatch {
                        tenant_id,
                        item_id: line.item_id,
                        location_id,
                        batch_id,
                        kind: ReceiptKind::Purchase,
                        quantity: receipt.quantity,
                        unit_cost: line.unit_cost,
                        expiry_date: line.expiry_date,
                        purchase_ref: Some(purchase_ref.clone()),
                        label: format!("{}-L{}", order.number(), line.line_no),
                        actor,
                        occurred_at,
                    }),
                )?;
                batch_ids.push(batch_id);
                received_value += receipt.quantity * line.unit_cost as i64;
            }

            let mut appends = stock.into_stream_appends()?;
            appends.push(staged(
                tenant_id,
                order_id.0,
                PURCHASE_AGGREGATE_TYPE,
                &order_events,
                order_version,
            )?);

            // What we now owe the supplier for the received goods.
            let mut ledger_entry = None;
            if order.payment_status() != PaymentStatus::Paid {
                let party = PartyRef::supplier(supplier_id);
                let (ledger, ledger_version) = self.load_ledger(tenant_id, party)?;
                let events = ledger
                    .handle(&LedgerCommand::AppendEntry(AppendEntry {
                        tenant_id,
                        party,
                        entry_id: EntryId::new(),
                        location_id: Some(location_id),
                        kind: EntryKind::DebitNote,
                        source: purchase_ref.clone(),
                        debit: received_value,
                        credit: 0,
                        description: format!("Goods received {}", order.number()),
                        transaction_date: occurred_at,
                        due_date: None,
                        payment_method: None,
                        created_by: actor,
                        occurred_at,
                    }))
                    .map_err(DispatchError::from)?;
                ledger_entry = appended_entry(&events);
                appends.push(staged(
                    tenant_id,
                    party.stream_id(),
                    LEDGER_AGGREGATE_TYPE,
                    &events,
                    ledger_version,
                )?);
            }

            self.commit_and_publish(appends)?;
            debug!(order = %order.number(), batches = batch_ids.len(), "purchase received");

            Ok(ReceiveOutcome {
                batch_ids,
                status: new_status,
                ledger_entry,
            })
        })
    }

    /// Return goods to the supplier: every line validates against what is
    /// still returnable, stock comes out of the origin purchase's batches,
    /// and the supplier ledger is credited. One bad line aborts the whole
    /// return.
    pub fn process_return(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        lines: Vec<ReturnLine>,
        reason: String,
        notes: Option<String>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<ReturnOutcome, DispatchError> {
        let return_doc_id = Uuid::now_v7();
        let return_no = format!(
            "RET-{}",
            &return_doc_id.simple().to_string()[..8].to_uppercase()
        );

        self.with_conflict_retry("process_return", || {
            let (order, order_version) = self.load_purchase(tenant_id, order_id)?;

            let order_events = order
                .handle(&PurchaseOrderCommand::RecordReturn(RecordReturn {
                    tenant_id,
                    order_id,
                    return_no: return_no.clone(),
                    lines: lines.clone(),
                    reason: reason.clone(),
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let recorded = match &order_events[..] {
                [PurchaseOrderEvent::ReturnRecorded(e)] => e.lines.clone(),
                _ => {
                    return Err(DispatchError::InvariantViolation(
                        "return decided no record".to_string(),
                    ));
                }
            };

            let location_id = order
                .location_id()
                .ok_or_else(|| DispatchError::Validation("order has no location".to_string()))?;
            let supplier_id = order
                .supplier_id()
                .ok_or_else(|| DispatchError::Validation("order has no supplier".to_string()))?;
            let purchase_ref = DocRef::new(
                DocumentKind::Purchase,
                *order_id.0.as_uuid(),
                order.number().to_string(),
            );
            let return_ref = DocRef::new(DocumentKind::PurchaseReturn, return_doc_id, return_no.clone());

            let mut stock = StockSession::new(&self.store, tenant_id, location_id);
            let mut total_amount = 0i64;
            for line in &recorded {
                stock.run(
                    line.item_id,
                    StockCommand::AllocateReturn(AllocateReturn {
                        tenant_id,
                        item_id: line.item_id,
                        location_id,
                        quantity: line.quantity,
                        purchase_ref: purchase_ref.clone(),
                        return_ref: return_ref.clone(),
                        reason: reason.clone(),
                        actor,
                        occurred_at,
                    }),
                )?;
                total_amount += line.amount;
            }

            let mut appends = stock.into_stream_appends()?;
            appends.push(staged(
                tenant_id,
                order_id.0,
                PURCHASE_AGGREGATE_TYPE,
                &order_events,
                order_version,
            )?);

            // Credit note: the return reduces what we owe the supplier.
            let party = PartyRef::supplier(supplier_id);
            let (ledger, ledger_version) = self.load_ledger(tenant_id, party)?;
            let description = match &notes {
                Some(n) => format!("Purchase return {return_no} ({reason}): {n}"),
                None => format!("Purchase return {return_no} ({reason})"),
            };
            let ledger_events = ledger
                .handle(&LedgerCommand::AppendEntry(AppendEntry {
                    tenant_id,
                    party,
                    entry_id: EntryId::new(),
                    location_id: Some(location_id),
                    kind: EntryKind::CreditNote,
                    source: return_ref.clone(),
                    debit: 0,
                    credit: total_amount,
                    description,
                    transaction_date: occurred_at,
                    due_date: None,
                    payment_method: None,
                    created_by: actor,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let ledger_entry = appended_entry(&ledger_events).ok_or_else(|| {
                DispatchError::InvariantViolation("return decided no ledger entry".to_string())
            })?;
            appends.push(staged(
                tenant_id,
                party.stream_id(),
                LEDGER_AGGREGATE_TYPE,
                &ledger_events,
                ledger_version,
            )?);

            self.commit_and_publish(appends)?;
            debug!(order = %order.number(), return_no = %return_no, "purchase return processed");

            let records = recorded
                .iter()
                .map(|line| ReturnRecord {
                    return_no: return_no.clone(),
                    line_no: line.line_no,
                    item_id: line.item_id,
                    quantity: line.quantity,
                    amount: line.amount,
                    reason: reason.clone(),
                    status: tillcore_purchasing::ReturnStatus::Approved,
                    recorded_at: occurred_at,
                })
                .collect();

            Ok(ReturnOutcome {
                return_no: return_no.clone(),
                records,
                ledger_entry,
            })
        })
    }

    /// Record a payment made to the supplier of a purchase order: a payment
    /// entry on the supplier ledger plus the order's cached payment status,
    /// in one atomic unit.
    pub fn record_purchase_payment(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        amount: i64,
        method: PaymentMethod,
        reference: Option<String>,
        notes: Option<String>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PaymentOutcome, DispatchError> {
        let payment_doc_id = Uuid::now_v7();

        self.with_conflict_retry("record_purchase_payment", || {
            let (order, order_version) = self.load_purchase(tenant_id, order_id)?;
            let supplier_id = order
                .supplier_id()
                .ok_or_else(|| DispatchError::Validation("order has no supplier".to_string()))?;

            let order_events = order
                .handle(&PurchaseOrderCommand::RegisterPayment(RegisterPayment {
                    tenant_id,
                    order_id,
                    amount,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let payment_status = match &order_events[..] {
                [PurchaseOrderEvent::PaymentRegistered(e)] => e.new_payment_status,
                _ => order.payment_status(),
            };

            let party = PartyRef::supplier(supplier_id);
            let (ledger, ledger_version) = self.load_ledger(tenant_id, party)?;
            let ledger_events = ledger
                .handle(&LedgerCommand::RecordPayment(RecordPayment {
                    tenant_id,
                    party,
                    entry_id: EntryId::new(),
                    location_id: order.location_id(),
                    source: DocRef::new(
                        DocumentKind::Payment,
                        payment_doc_id,
                        format!("PAY-{}", order.number()),
                    ),
                    amount,
                    method,
                    reference: reference.clone(),
                    notes: notes.clone(),
                    transaction_date: occurred_at,
                    created_by: actor,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let ledger_entry = appended_entry(&ledger_events).ok_or_else(|| {
                DispatchError::InvariantViolation("payment decided no ledger entry".to_string())
            })?;

            let appends = vec![
                staged(
                    tenant_id,
                    order_id.0,
                    PURCHASE_AGGREGATE_TYPE,
                    &order_events,
                    order_version,
                )?,
                staged(
                    tenant_id,
                    party.stream_id(),
                    LEDGER_AGGREGATE_TYPE,
                    &ledger_events,
                    ledger_version,
                )?,
            ];
            self.commit_and_publish(appends)?;

            Ok(PaymentOutcome {
                ledger_entry,
                payment_status,
            })
        })
    }

    /// Record a payment received from a customer against their ledger.
    ///
    /// The sale document's own payment-status cache lives outside the core;
    /// callers update it from the returned entry.
    pub fn record_customer_payment(
        &self,
        tenant_id: TenantId,
        customer_id: PartyId,
        amount: i64,
        method: PaymentMethod,
        reference: Option<String>,
        notes: Option<String>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<LedgerEntry, DispatchError> {
        let payment_doc_id = Uuid::now_v7();
        let number = format!(
            "PAY-{}",
            &payment_doc_id.simple().to_string()[..8].to_uppercase()
        );

        self.with_conflict_retry("record_customer_payment", || {
            let party = PartyRef::customer(customer_id);
            let (ledger, version) = self.load_ledger(tenant_id, party)?;
            let events = ledger
                .handle(&LedgerCommand::RecordPayment(RecordPayment {
                    tenant_id,
                    party,
                    entry_id: EntryId::new(),
                    location_id: None,
                    source: DocRef::new(DocumentKind::Payment, payment_doc_id, number.clone()),
                    amount,
                    method,
                    reference: reference.clone(),
                    notes: notes.clone(),
                    transaction_date: occurred_at,
                    created_by: actor,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;
            let entry = appended_entry(&events).ok_or_else(|| {
                DispatchError::InvariantViolation("payment decided no ledger entry".to_string())
            })?;

            self.commit_and_publish(vec![staged(
                tenant_id,
                party.stream_id(),
                LEDGER_AGGREGATE_TYPE,
                &events,
                version,
            )?])?;

            Ok(entry)
        })
    }

    /// Move stock between locations: FIFO consumption at the source and a
    /// fresh batch at the destination, committed together. Batch identity is
    /// not preserved; the destination batch inherits the unit cost and expiry
    /// of the oldest batch consumed.
    pub fn transfer_stock(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        from_location: LocationId,
        to_location: LocationId,
        quantity: i64,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<TransferOutcome, DispatchError> {
        if from_location == to_location {
            return Err(DispatchError::Validation(
                "transfer source and destination are the same location".to_string(),
            ));
        }

        let transfer_doc_id = Uuid::now_v7();
        let number = format!(
            "TRF-{}",
            &transfer_doc_id.simple().to_string()[..8].to_uppercase()
        );
        let transfer_ref = DocRef::new(DocumentKind::Transfer, transfer_doc_id, number);

        self.with_conflict_retry("transfer_stock", || {
            let source_stream = StockStreamId::for_key(item_id, from_location);
            let (source, source_version) = self.load_stock(tenant_id, source_stream)?;

            let out_events = source
                .handle(&StockCommand::AllocateConsumption(AllocateConsumption {
                    tenant_id,
                    item_id,
                    location_id: from_location,
                    kind: ConsumptionKind::TransferOut,
                    quantity,
                    source: transfer_ref.clone(),
                    actor,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;

            // The destination lot carries the cost and expiry of the oldest
            // batch the transfer drew from.
            let allocations = consumed_allocations(&out_events);
            let first = allocations.first().ok_or_else(|| {
                DispatchError::InvariantViolation("transfer decided no allocation".to_string())
            })?;
            let expiry_date = source
                .batches()
                .iter()
                .find(|b| b.id == first.batch_id)
                .and_then(|b| b.expiry_date);

            let destination_stream = StockStreamId::for_key(item_id, to_location);
            let (destination, destination_version) =
                self.load_stock(tenant_id, destination_stream)?;
            let destination_batch_id = BatchId::new();
            let in_events = destination
                .handle(&StockCommand::ReceiveBatch(ReceiveBatch {
                    tenant_id,
                    item_id,
                    location_id: to_location,
                    batch_id: destination_batch_id,
                    kind: ReceiptKind::TransferIn,
                    quantity,
                    unit_cost: first.unit_cost,
                    expiry_date,
                    purchase_ref: None,
                    label: transfer_ref.number.clone(),
                    actor,
                    occurred_at,
                }))
                .map_err(DispatchError::from)?;

            self.commit_and_publish(vec![
                staged(
                    tenant_id,
                    source_stream.0,
                    STOCK_AGGREGATE_TYPE,
                    &out_events,
                    source_version,
                )?,
                staged(
                    tenant_id,
                    destination_stream.0,
                    STOCK_AGGREGATE_TYPE,
                    &in_events,
                    destination_version,
                )?,
            ])?;

            Ok(TransferOutcome {
                destination_batch_id,
                quantity,
            })
        })
    }

    // -- plumbing ----------------------------------------------------------

    fn load_stock(
        &self,
        tenant_id: TenantId,
        stream_id: StockStreamId,
    ) -> Result<(ItemStock, u64), DispatchError> {
        let history = self.store.load_stream(tenant_id, stream_id.0)?;
        validate_loaded_stream(tenant_id, stream_id.0, &history)?;
        let version = stream_version(&history);
        let mut aggregate = ItemStock::empty(stream_id);
        apply_history::<ItemStock>(&mut aggregate, &history)?;
        Ok((aggregate, version))
    }

    fn load_ledger(
        &self,
        tenant_id: TenantId,
        party: PartyRef,
    ) -> Result<(PartyLedger, u64), DispatchError> {
        let stream_id = party.stream_id();
        let history = self.store.load_stream(tenant_id, stream_id)?;
        validate_loaded_stream(tenant_id, stream_id, &history)?;
        let version = stream_version(&history);
        let mut aggregate = PartyLedger::empty(LedgerStreamId::new(stream_id));
        apply_history::<PartyLedger>(&mut aggregate, &history)?;
        Ok((aggregate, version))
    }

    fn load_purchase(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<(PurchaseOrder, u64), DispatchError> {
        let history = self.store.load_stream(tenant_id, order_id.0)?;
        validate_loaded_stream(tenant_id, order_id.0, &history)?;
        if history.is_empty() {
            return Err(DispatchError::NotFound);
        }
        let version = stream_version(&history);
        let mut aggregate = PurchaseOrder::empty(order_id);
        apply_history::<PurchaseOrder>(&mut aggregate, &history)?;
        Ok((aggregate, version))
    }

    fn commit_and_publish(&self, appends: Vec<StreamAppend>) -> Result<(), DispatchError> {
        let committed = self.store.append_multi(appends)?;
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }
        Ok(())
    }

    /// Re-run the whole operation after optimistic-concurrency conflicts,
    /// a bounded number of times. Every retry starts from a fresh read, so a
    /// competing writer's effect is visible to the loser.
    fn with_conflict_retry<T>(
        &self,
        operation: &'static str,
        mut attempt: impl FnMut() -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let mut last = String::new();
        for round in 0..MAX_CONFLICT_RETRIES {
            match attempt() {
                Err(DispatchError::Concurrency(msg)) => {
                    warn!(operation, round, "concurrency conflict, retrying");
                    last = msg;
                }
                other => return other,
            }
        }
        Err(DispatchError::Concurrency(format!(
            "{operation} failed after {MAX_CONFLICT_RETRIES} conflict retries: {last}"
        )))
    }
}

/// Session over the stock streams one operation touches.
///
/// Lines hitting the same (item, location) share a rehydrated aggregate, so
/// later commands see earlier decisions within the same operation, and all of
/// a stream's events land in a single `StreamAppend`.
struct StockSession<'a, S> {
    store: &'a S,
    tenant_id: TenantId,
    location_id: LocationId,
    streams: HashMap<StockStreamId, (ItemStock, u64, Vec<StockEvent>)>,
    order: Vec<StockStreamId>,
}

impl<'a, S> StockSession<'a, S>
where
    S: EventStore,
{
    fn new(store: &'a S, tenant_id: TenantId, location_id: LocationId) -> Self {
        Self {
            store,
            tenant_id,
            location_id,
            streams: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn run(&mut self, item_id: ItemId, command: StockCommand) -> Result<Vec<StockEvent>, DispatchError> {
        let stream_id = StockStreamId::for_key(item_id, self.location_id);

        if !self.streams.contains_key(&stream_id) {
            let history = self.store.load_stream(self.tenant_id, stream_id.0)?;
            validate_loaded_stream(self.tenant_id, stream_id.0, &history)?;
            let version = stream_version(&history);
            let mut aggregate = ItemStock::empty(stream_id);
            apply_history::<ItemStock>(&mut aggregate, &history)?;
            self.streams.insert(stream_id, (aggregate, version, Vec::new()));
            self.order.push(stream_id);
        }

        let (aggregate, _, staged_events) = self
            .streams
            .get_mut(&stream_id)
            .ok_or(DispatchError::NotFound)?;

        let events = aggregate.handle(&command).map_err(DispatchError::from)?;
        for event in &events {
            aggregate.apply(event);
        }
        staged_events.extend(events.clone());
        Ok(events)
    }

    fn into_stream_appends(mut self) -> Result<Vec<StreamAppend>, DispatchError> {
        let tenant_id = self.tenant_id;
        let mut appends = Vec::with_capacity(self.order.len());
        for stream_id in std::mem::take(&mut self.order) {
            if let Some((_, version, events)) = self.streams.remove(&stream_id) {
                appends.push(staged(
                    tenant_id,
                    stream_id.0,
                    STOCK_AGGREGATE_TYPE,
                    &events,
                    version,
                )?);
            }
        }
        Ok(appends)
    }
}

fn staged<E>(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    aggregate_type: &str,
    events: &[E],
    loaded_version: u64,
) -> Result<StreamAppend, DispatchError>
where
    E: tillcore_events::Event + Serialize,
{
    let uncommitted = events
        .iter()
        .map(|ev| {
            UncommittedEvent::from_typed(
                tenant_id,
                aggregate_id,
                aggregate_type,
                Uuid::now_v7(),
                ev,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StreamAppend {
        events: uncommitted,
        expected_version: ExpectedVersion::Exact(loaded_version),
    })
}

fn consumed_allocations(events: &[StockEvent]) -> Vec<BatchAllocation> {
    events
        .iter()
        .flat_map(|e| match e {
            StockEvent::StockConsumed(c) => c.allocations.clone(),
            StockEvent::StockReturned(r) => r.allocations.clone(),
            StockEvent::BatchReceived(_) => Vec::new(),
        })
        .collect()
}

fn appended_entry(events: &[LedgerEvent]) -> Option<LedgerEntry> {
    events.iter().find_map(|e| match e {
        LedgerEvent::EntryAppended(a) => Some(a.entry.clone()),
        _ => None,
    })
}
