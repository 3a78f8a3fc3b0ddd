//! Batch-level stock tracking: receipt lots, FIFO allocation, returns.

mod batch;
mod item_stock;

pub use batch::{Batch, BatchId};
pub use item_stock::{
    AllocateConsumption, AllocateReturn, BatchAllocation, BatchReceived, ConsumptionKind,
    ItemStock, ReceiptKind, ReceiveBatch, StockCommand, StockConsumed, StockEvent, StockReturned,
    StockStreamId,
};
