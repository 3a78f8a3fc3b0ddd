//! Append-only event storage: trait, in-memory store, Postgres store.

mod in_memory;
mod postgres;
mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, SCHEMA};
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
