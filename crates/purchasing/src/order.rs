use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tillcore_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ItemId, LocationId, TenantId};
use tillcore_events::Event;
use tillcore_parties::PartyId;

/// Purchase order identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchase order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Draft,
    Ordered,
    PartiallyReceived,
    Received,
}

/// How much of the order value has been settled with the supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

/// One ordered line with its receive/return bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub line_no: u32,
    pub item_id: ItemId,
    pub quantity_ordered: i64,
    pub quantity_received: i64,
    pub quantity_returned: i64,
    /// Unit cost in smallest currency unit.
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
}

impl PurchaseLine {
    pub fn outstanding(&self) -> i64 {
        self.quantity_ordered - self.quantity_received
    }

    /// Units received from the supplier that have not been sent back yet.
    pub fn returnable(&self) -> i64 {
        self.quantity_received - self.quantity_returned
    }
}

/// Status of a recorded supplier return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnStatus {
    Approved,
}

/// A recorded return against one purchase line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub return_no: String,
    pub line_no: u32,
    pub item_id: ItemId,
    pub quantity: i64,
    /// quantity x unit_cost, in smallest currency unit.
    pub amount: i64,
    pub reason: String,
    pub status: ReturnStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: Option<TenantId>,
    supplier_id: Option<PartyId>,
    location_id: Option<LocationId>,
    number: String,
    status: PurchaseStatus,
    payment_status: PaymentStatus,
    paid_total: i64,
    lines: Vec<PurchaseLine>,
    returns: Vec<ReturnRecord>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            supplier_id: None,
            location_id: None,
            number: String::new(),
            status: PurchaseStatus::Draft,
            payment_status: PaymentStatus::Unpaid,
            paid_total: 0,
            lines: Vec::new(),
            returns: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn supplier_id(&self) -> Option<PartyId> {
        self.supplier_id
    }

    pub fn location_id(&self) -> Option<LocationId> {
        self.location_id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn status(&self) -> PurchaseStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn paid_total(&self) -> i64 {
        self.paid_total
    }

    pub fn lines(&self) -> &[PurchaseLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&PurchaseLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn returns(&self) -> &[ReturnRecord] {
        &self.returns
    }

    /// Document value: ordered quantity x unit cost over all lines.
    pub fn total_cost(&self) -> i64 {
        self.lines
            .iter()
            .map(|l| l.quantity_ordered * l.unit_cost as i64)
            .sum()
    }

    fn payment_status_for(&self, paid_total: i64) -> PaymentStatus {
        if paid_total <= 0 {
            PaymentStatus::Unpaid
        } else if paid_total < self.total_cost() {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Paid
        }
    }

    fn receive_status_after(&self, receipts: &[LineReceipt]) -> PurchaseStatus {
        let fully_received = self.lines.iter().all(|line| {
            let extra: i64 = receipts
                .iter()
                .filter(|r| r.line_no == line.line_no)
                .map(|r| r.quantity)
                .sum();
            line.quantity_received + extra >= line.quantity_ordered
        });
        if fully_received {
            PurchaseStatus::Received
        } else {
            PurchaseStatus::PartiallyReceived
        }
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: PartyId,
    pub location_id: LocationId,
    pub number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub item_id: ItemId,
    pub quantity: i64,
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOrdered (Draft -> Ordered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Quantity received against one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceipt {
    pub line_no: u32,
    pub quantity: i64,
}

/// Command: ReceiveLines. Books received quantities (partial receives allowed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveLines {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub receipts: Vec<LineReceipt>,
    pub occurred_at: DateTime<Utc>,
}

/// Quantity returned against one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLine {
    pub line_no: u32,
    pub quantity: i64,
}

/// Command: RecordReturn. Books a supplier return across lines.
///
/// All lines validate before anything is booked; one bad line rejects the
/// whole return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReturn {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub return_no: String,
    pub lines: Vec<ReturnLine>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RegisterPayment. Tracks settled value against the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayment {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLine(AddLine),
    MarkOrdered(MarkOrdered),
    ReceiveLines(ReceiveLines),
    RecordReturn(RecordReturn),
    RegisterPayment(RegisterPayment),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: PartyId,
    pub location_id: LocationId,
    pub number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLineAdded {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub item_id: ItemId,
    pub quantity: i64,
    pub unit_cost: u64,
    pub expiry_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LinesReceived. Received quantities booked, status rolled forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinesReceived {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub receipts: Vec<LineReceipt>,
    pub new_status: PurchaseStatus,
    pub occurred_at: DateTime<Utc>,
}

/// One priced line of a recorded return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLineRecorded {
    pub line_no: u32,
    pub item_id: ItemId,
    pub quantity: i64,
    pub amount: i64,
}

/// Event: ReturnRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRecorded {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub return_no: String,
    pub lines: Vec<ReturnLineRecorded>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRegistered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub amount: i64,
    pub new_paid_total: i64,
    pub new_payment_status: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseLineAdded(PurchaseLineAdded),
    PurchaseOrdered(PurchaseOrdered),
    LinesReceived(LinesReceived),
    ReturnRecorded(ReturnRecorded),
    PaymentRegistered(PaymentRegistered),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseLineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::PurchaseOrdered(_) => "purchasing.order.ordered",
            PurchaseOrderEvent::LinesReceived(_) => "purchasing.order.lines_received",
            PurchaseOrderEvent::ReturnRecorded(_) => "purchasing.order.return_recorded",
            PurchaseOrderEvent::PaymentRegistered(_) => "purchasing.order.payment_registered",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseLineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrdered(e) => e.occurred_at,
            PurchaseOrderEvent::LinesReceived(e) => e.occurred_at,
            PurchaseOrderEvent::ReturnRecorded(e) => e.occurred_at,
            PurchaseOrderEvent::PaymentRegistered(e) => e.occurred_at,
        }
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.supplier_id = Some(e.supplier_id);
                self.location_id = Some(e.location_id);
                self.number = e.number.clone();
                self.status = PurchaseStatus::Draft;
                self.payment_status = PaymentStatus::Unpaid;
                self.paid_total = 0;
                self.lines.clear();
                self.returns.clear();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseLineAdded(e) => {
                self.lines.push(PurchaseLine {
                    line_no: e.line_no,
                    item_id: e.item_id,
                    quantity_ordered: e.quantity,
                    quantity_received: 0,
                    quantity_returned: 0,
                    unit_cost: e.unit_cost,
                    expiry_date: e.expiry_date,
                });
            }
            PurchaseOrderEvent::PurchaseOrdered(_) => {
                self.status = PurchaseStatus::Ordered;
            }
            PurchaseOrderEvent::LinesReceived(e) => {
                for receipt in &e.receipts {
                    if let Some(line) =
                        self.lines.iter_mut().find(|l| l.line_no == receipt.line_no)
                    {
                        line.quantity_received += receipt.quantity;
                    }
                }
                self.status = e.new_status;
            }
            PurchaseOrderEvent::ReturnRecorded(e) => {
                for line in &e.lines {
                    if let Some(po_line) =
                        self.lines.iter_mut().find(|l| l.line_no == line.line_no)
                    {
                        po_line.quantity_returned += line.quantity;
                    }
                    self.returns.push(ReturnRecord {
                        return_no: e.return_no.clone(),
                        line_no: line.line_no,
                        item_id: line.item_id,
                        quantity: line.quantity,
                        amount: line.amount,
                        reason: e.reason.clone(),
                        status: ReturnStatus::Approved,
                        recorded_at: e.occurred_at,
                    });
                }
            }
            PurchaseOrderEvent::PaymentRegistered(e) => {
                self.paid_total = e.new_paid_total;
                self.payment_status = e.new_payment_status;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::MarkOrdered(cmd) => self.handle_mark_ordered(cmd),
            PurchaseOrderCommand::ReceiveLines(cmd) => self.handle_receive_lines(cmd),
            PurchaseOrderCommand::RecordReturn(cmd) => self.handle_record_return(cmd),
            PurchaseOrderCommand::RegisterPayment(cmd) => self.handle_register_payment(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.number.trim().is_empty() {
            return Err(DomainError::validation("order number cannot be empty"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                supplier_id: cmd.supplier_id,
                location_id: cmd.location_id,
                number: cmd.number.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseStatus::Draft {
            return Err(DomainError::invariant(
                "cannot modify purchase order once ordered or received",
            ));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::PurchaseLineAdded(
            PurchaseLineAdded {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                line_no: next_line_no,
                item_id: cmd.item_id,
                quantity: cmd.quantity,
                unit_cost: cmd.unit_cost,
                expiry_date: cmd.expiry_date,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_mark_ordered(
        &self,
        cmd: &MarkOrdered,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseStatus::Draft {
            return Err(DomainError::invariant("only draft orders can be placed"));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation("cannot place an order without lines"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrdered(PurchaseOrdered {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive_lines(
        &self,
        cmd: &ReceiveLines,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            PurchaseStatus::Ordered | PurchaseStatus::PartiallyReceived => {}
            PurchaseStatus::Draft => {
                return Err(DomainError::invariant(
                    "cannot receive goods before the order is placed",
                ));
            }
            PurchaseStatus::Received => {
                return Err(DomainError::invariant("order is already fully received"));
            }
        }

        if cmd.receipts.is_empty() {
            return Err(DomainError::validation("nothing to receive"));
        }

        for receipt in &cmd.receipts {
            let line = self
                .line(receipt.line_no)
                .ok_or_else(|| DomainError::validation(format!("unknown line {}", receipt.line_no)))?;
            if receipt.quantity <= 0 {
                return Err(DomainError::validation("receive quantity must be positive"));
            }
            if receipt.quantity > line.outstanding() {
                return Err(DomainError::validation(format!(
                    "line {}: receiving {} exceeds outstanding {}",
                    receipt.line_no,
                    receipt.quantity,
                    line.outstanding()
                )));
            }
        }

        Ok(vec![PurchaseOrderEvent::LinesReceived(LinesReceived {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            receipts: cmd.receipts.clone(),
            new_status: self.receive_status_after(&cmd.receipts),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_return(
        &self,
        cmd: &RecordReturn,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if cmd.lines.is_empty() {
            return Err(DomainError::validation("nothing to return"));
        }
        if cmd.return_no.trim().is_empty() {
            return Err(DomainError::validation("return number cannot be empty"));
        }

        // Validate every line before deciding anything; the cap is what was
        // received minus what earlier returns already took back.
        let mut recorded = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            let po_line = self
                .line(line.line_no)
                .ok_or_else(|| DomainError::validation(format!("unknown line {}", line.line_no)))?;
            if line.quantity <= 0 {
                return Err(DomainError::validation("return quantity must be positive"));
            }
            if line.quantity > po_line.returnable() {
                return Err(DomainError::exceeds_returnable(
                    line.quantity,
                    po_line.returnable(),
                ));
            }
            recorded.push(ReturnLineRecorded {
                line_no: line.line_no,
                item_id: po_line.item_id,
                quantity: line.quantity,
                amount: line.quantity * po_line.unit_cost as i64,
            });
        }

        Ok(vec![PurchaseOrderEvent::ReturnRecorded(ReturnRecorded {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            return_no: cmd.return_no.clone(),
            lines: recorded,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_register_payment(
        &self,
        cmd: &RegisterPayment,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if cmd.amount <= 0 {
            return Err(DomainError::validation("payment amount must be positive"));
        }

        let new_paid_total = self.paid_total + cmd.amount;
        Ok(vec![PurchaseOrderEvent::PaymentRegistered(
            PaymentRegistered {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                amount: cmd.amount,
                new_paid_total,
                new_payment_status: self.payment_status_for(new_paid_total),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_supplier_id() -> PartyId {
        PartyId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn placed_order(
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        quantities: &[i64],
    ) -> PurchaseOrder {
        let mut order = PurchaseOrder::empty(order_id);

        let create = CreatePurchaseOrder {
            tenant_id,
            order_id,
            supplier_id: test_supplier_id(),
            location_id: LocationId::new(),
            number: "PO-1001".to_string(),
            occurred_at: test_time(),
        };
        let events = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(create))
            .unwrap();
        order.apply(&events[0]);

        for qty in quantities {
            let add = AddLine {
                tenant_id,
                order_id,
                item_id: ItemId::new(),
                quantity: *qty,
                unit_cost: 100,
                expiry_date: None,
                occurred_at: test_time(),
            };
            let events = order.handle(&PurchaseOrderCommand::AddLine(add)).unwrap();
            order.apply(&events[0]);
        }

        let mark = MarkOrdered {
            tenant_id,
            order_id,
            occurred_at: test_time(),
        };
        let events = order
            .handle(&PurchaseOrderCommand::MarkOrdered(mark))
            .unwrap();
        order.apply(&events[0]);
        order
    }

    fn receive(order: &mut PurchaseOrder, tenant_id: TenantId, receipts: Vec<LineReceipt>) {
        let cmd = ReceiveLines {
            tenant_id,
            order_id: order.id_typed(),
            receipts,
            occurred_at: test_time(),
        };
        let events = order
            .handle(&PurchaseOrderCommand::ReceiveLines(cmd))
            .unwrap();
        order.apply(&events[0]);
    }

    #[test]
    fn partial_receive_moves_status_to_partially_received() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = placed_order(tenant_id, order_id, &[10, 20]);

        receive(
            &mut order,
            tenant_id,
            vec![LineReceipt {
                line_no: 1,
                quantity: 10,
            }],
        );

        assert_eq!(order.status(), PurchaseStatus::PartiallyReceived);
        assert_eq!(order.line(1).unwrap().quantity_received, 10);
        assert_eq!(order.line(2).unwrap().quantity_received, 0);

        receive(
            &mut order,
            tenant_id,
            vec![LineReceipt {
                line_no: 2,
                quantity: 20,
            }],
        );
        assert_eq!(order.status(), PurchaseStatus::Received);
    }

    #[test]
    fn cannot_receive_more_than_outstanding() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = placed_order(tenant_id, order_id, &[10]);

        receive(
            &mut order,
            tenant_id,
            vec![LineReceipt {
                line_no: 1,
                quantity: 7,
            }],
        );

        let cmd = ReceiveLines {
            tenant_id,
            order_id,
            receipts: vec![LineReceipt {
                line_no: 1,
                quantity: 4,
            }],
            occurred_at: test_time(),
        };
        let err = order
            .handle(&PurchaseOrderCommand::ReceiveLines(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn cannot_receive_before_order_is_placed() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);

        let create = CreatePurchaseOrder {
            tenant_id,
            order_id,
            supplier_id: test_supplier_id(),
            location_id: LocationId::new(),
            number: "PO-2".to_string(),
            occurred_at: test_time(),
        };
        let events = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(create))
            .unwrap();
        order.apply(&events[0]);

        let cmd = ReceiveLines {
            tenant_id,
            order_id,
            receipts: vec![LineReceipt {
                line_no: 1,
                quantity: 1,
            }],
            occurred_at: test_time(),
        };
        let err = order
            .handle(&PurchaseOrderCommand::ReceiveLines(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn return_cap_is_cumulative_across_calls() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = placed_order(tenant_id, order_id, &[100]);
        receive(
            &mut order,
            tenant_id,
            vec![LineReceipt {
                line_no: 1,
                quantity: 100,
            }],
        );

        let first = RecordReturn {
            tenant_id,
            order_id,
            return_no: "RET-1".to_string(),
            lines: vec![ReturnLine {
                line_no: 1,
                quantity: 70,
            }],
            reason: "overstock".to_string(),
            occurred_at: test_time(),
        };
        let events = order
            .handle(&PurchaseOrderCommand::RecordReturn(first))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.returns().len(), 1);
        assert_eq!(order.returns()[0].amount, 7_000);
        assert_eq!(order.returns()[0].status, ReturnStatus::Approved);

        let second = RecordReturn {
            tenant_id,
            order_id,
            return_no: "RET-2".to_string(),
            lines: vec![ReturnLine {
                line_no: 1,
                quantity: 40,
            }],
            reason: "overstock".to_string(),
            occurred_at: test_time(),
        };
        let err = order
            .handle(&PurchaseOrderCommand::RecordReturn(second))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::ExceedsReturnable {
                requested: 40,
                returnable: 30
            }
        );
        // Nothing was booked by the failed call.
        assert_eq!(order.returns().len(), 1);
        assert_eq!(order.line(1).unwrap().quantity_returned, 70);
    }

    #[test]
    fn one_bad_line_rejects_the_whole_return() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = placed_order(tenant_id, order_id, &[10, 10]);
        receive(
            &mut order,
            tenant_id,
            vec![
                LineReceipt {
                    line_no: 1,
                    quantity: 10,
                },
                LineReceipt {
                    line_no: 2,
                    quantity: 10,
                },
            ],
        );

        let cmd = RecordReturn {
            tenant_id,
            order_id,
            return_no: "RET-9".to_string(),
            lines: vec![
                ReturnLine {
                    line_no: 1,
                    quantity: 5,
                },
                ReturnLine {
                    line_no: 2,
                    quantity: 11,
                },
            ],
            reason: "defect".to_string(),
            occurred_at: test_time(),
        };
        let err = order
            .handle(&PurchaseOrderCommand::RecordReturn(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::ExceedsReturnable { .. }));
        assert!(order.returns().is_empty());
        assert_eq!(order.line(1).unwrap().quantity_returned, 0);
    }

    #[test]
    fn payment_status_rolls_from_unpaid_through_partial_to_paid() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = placed_order(tenant_id, order_id, &[10]);
        assert_eq!(order.payment_status(), PaymentStatus::Unpaid);
        assert_eq!(order.total_cost(), 1_000);

        let pay = |order: &mut PurchaseOrder, amount: i64| {
            let cmd = RegisterPayment {
                tenant_id,
                order_id,
                amount,
                occurred_at: test_time(),
            };
            let events = order
                .handle(&PurchaseOrderCommand::RegisterPayment(cmd))
                .unwrap();
            order.apply(&events[0]);
        };

        pay(&mut order, 400);
        assert_eq!(order.payment_status(), PaymentStatus::Partial);
        assert_eq!(order.paid_total(), 400);

        pay(&mut order, 600);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert_eq!(order.paid_total(), 1_000);
    }
}
