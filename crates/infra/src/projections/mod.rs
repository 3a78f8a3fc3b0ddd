//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Tenant-isolated**: Data is partitioned by tenant
//! - **Idempotent**: Safe for at-least-once delivery

pub mod cursor_store;

pub mod movement_log;
pub mod party_balances;
pub mod stock_levels;

pub use cursor_store::{InMemoryCursorStore, PostgresCursorStore, ProjectionCursorStore};
pub use movement_log::{
    Movement, MovementKind, MovementLogError, MovementLogProjection, MovementQuery,
};
pub use party_balances::{PartyBalance, PartyBalanceProjectionError, PartyBalancesProjection};
pub use stock_levels::{StockLevel, StockLevelProjectionError, StockLevelsProjection};
