//! Purchase order bookkeeping: received quantities, status, payments, returns.

mod order;

pub use order::{
    AddLine, CreatePurchaseOrder, LineReceipt, LinesReceived, MarkOrdered, PaymentRegistered,
    PaymentStatus, PurchaseLine, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderCreated,
    ReceiveLines,
    PurchaseOrderEvent, PurchaseOrderId, PurchaseOrdered, PurchaseStatus, RecordReturn,
    RegisterPayment, ReturnLine, ReturnLineRecorded, ReturnRecord, ReturnRecorded, ReturnStatus,
    PurchaseLineAdded,
};
