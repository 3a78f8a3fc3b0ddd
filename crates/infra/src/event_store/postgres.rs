//! Postgres-backed event store implementation.
//!
//! Persistent event store using PostgreSQL as the backing storage. Enforces
//! tenant isolation, optimistic concurrency control, and append-only
//! semantics at the database level.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `EventStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent append detected (unique constraint on sequence_number) |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` | Invalid data (e.g., sequence_number <= 0) |
//! | Database (other) | Any other | `InvalidAppend` | Other database errors |
//! | PoolClosed | N/A | `InvalidAppend` | Connection pool was closed |
//!
//! ## Multi-Stream Atomicity
//!
//! `append_multi` runs every stream's version check and insert inside one
//! SQL transaction. Concurrent writers that slip between the check and the
//! insert hit the unique `(tenant_id, aggregate_id, sequence_number)` index
//! and surface as `Concurrency`, so the caller's bounded retry kicks in.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{Span, instrument};

use tillcore_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// Events table DDL (idempotent).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (tenant_id, aggregate_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS idx_events_tenant_aggregate
    ON events (tenant_id, aggregate_id, sequence_number);
"#;

/// Postgres-backed append-only event store.
///
/// Thread-safe via the SQLx connection pool. Every query carries `tenant_id`
/// in the WHERE clause; the unique sequence index is the last line of defense
/// against concurrent appends.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the events table and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Load all events for a tenant + aggregate stream.
    ///
    /// Events are returned in sequence number order (ascending).
    /// Returns an empty vector if the stream doesn't exist.
    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            aggregate_id = %aggregate_id.as_uuid()
        ),
        err
    )]
    pub async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let span = Span::current();
        span.record("operation", "load_stream");

        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload,
                created_at
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::InvalidAppend(format!("failed to deserialize event row: {}", e))
            })?;
            stored_events.push(stored.into());
        }

        span.record("event_count", stored_events.len());
        Ok(stored_events)
    }

    /// Load every stream of a tenant, ordered by (aggregate, sequence).
    ///
    /// Projection rebuild path; paginate upstream if a tenant's history is large.
    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid()), err)]
    pub async fn load_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload,
                created_at
            FROM events
            WHERE tenant_id = $1
            ORDER BY aggregate_id ASC, sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_tenant", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::InvalidAppend(format!("failed to deserialize event row: {}", e))
            })?;
            stored_events.push(stored.into());
        }

        Ok(stored_events)
    }

    /// Append events to a single stream with optimistic concurrency control.
    #[instrument(
        skip(self, events),
        fields(event_count = events.len(), expected_version = ?expected_version),
        err
    )]
    pub async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_multi(vec![StreamAppend {
            events,
            expected_version,
        }])
        .await
    }

    /// Append to several distinct streams in one SQL transaction.
    ///
    /// Either every stream's slice commits or none does; a version conflict
    /// on any stream rolls the whole transaction back with `Concurrency`.
    #[instrument(skip(self, batches), fields(batch_count = batches.len()), err)]
    pub async fn append_multi(
        &self,
        batches: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batches: Vec<StreamAppend> =
            batches.into_iter().filter(|b| !b.events.is_empty()).collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let span = Span::current();
        span.record("operation", "append_multi");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut stored_events = Vec::new();

        for batch in batches {
            // Validate all events in the slice target the same stream.
            let tenant_id = batch.events[0].tenant_id;
            let aggregate_id = batch.events[0].aggregate_id;
            let aggregate_type = batch.events[0].aggregate_type.clone();
            for (idx, e) in batch.events.iter().enumerate() {
                if e.tenant_id != tenant_id {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(EventStoreError::TenantIsolation(format!(
                        "batch contains multiple tenant_ids (index {idx})"
                    )));
                }
                if e.aggregate_id != aggregate_id {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(EventStoreError::InvalidAppend(format!(
                        "batch contains multiple aggregate_ids (index {idx})"
                    )));
                }
            }

            let (current_version, existing_aggregate_type) =
                check_stream_version(&mut tx, tenant_id, aggregate_id).await?;

            if let Some(ref existing_type) = existing_aggregate_type {
                if existing_type != &aggregate_type {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing_type, aggregate_type
                    )));
                }
            }

            if !batch.expected_version.matches(current_version) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "optimistic concurrency check failed: expected {:?}, found {}",
                    batch.expected_version, current_version
                )));
            }

            let mut next_sequence = current_version + 1;
            for event in batch.events {
                sqlx::query(
                    r#"
                    INSERT INTO events (
                        event_id,
                        tenant_id,
                        aggregate_id,
                        aggregate_type,
                        sequence_number,
                        event_type,
                        event_version,
                        occurred_at,
                        payload
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(event.event_id)
                .bind(tenant_id.as_uuid())
                .bind(aggregate_id.as_uuid())
                .bind(&aggregate_type)
                .bind(next_sequence as i64)
                .bind(&event.event_type)
                .bind(event.event_version as i32)
                .bind(event.occurred_at)
                .bind(&event.payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    // Unique constraint violations mean another transaction
                    // appended concurrently between our check and insert.
                    if is_unique_violation(&e) {
                        EventStoreError::Concurrency(format!(
                            "concurrent append detected: sequence_number {} already exists",
                            next_sequence
                        ))
                    } else {
                        map_sqlx_error("insert_event", e)
                    }
                })?;

                stored_events.push(StoredEvent {
                    event_id: event.event_id,
                    tenant_id: event.tenant_id,
                    aggregate_id: event.aggregate_id,
                    aggregate_type: event.aggregate_type,
                    sequence_number: next_sequence,
                    event_type: event.event_type,
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload,
                });
                next_sequence += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        span.record("committed_events", stored_events.len());
        Ok(stored_events)
    }
}

/// Check the current version of a stream.
///
/// Returns `(current_version, aggregate_type)` where `current_version` is 0
/// and `aggregate_type` is `None` if the stream doesn't exist.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) as current_version,
            MAX(aggregate_type) as aggregate_type
        FROM events
        WHERE tenant_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row.try_get("current_version").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read current_version: {}", e))
    })?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(|e| {
        EventStoreError::InvalidAppend(format!("failed to read aggregate_type: {}", e))
    })?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            if let Some(code) = db_err.code() {
                match code.as_ref() {
                    // Unique violation: concurrent append.
                    "23505" => EventStoreError::Concurrency(msg),
                    _ => EventStoreError::InvalidAppend(msg),
                }
            } else {
                EventStoreError::InvalidAppend(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::InvalidAppend(format!("connection pool closed in {}", operation))
        }
        _ => EventStoreError::InvalidAppend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}
