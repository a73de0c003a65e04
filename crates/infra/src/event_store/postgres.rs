//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent append on `(stream_id, version)` |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` | Invalid data (e.g. version <= 0) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Sync Boundary
//!
//! The [`EventStore`] trait is synchronous because command dispatch runs on projection
//! worker threads. The store keeps a handle to the tokio runtime that owns the pool
//! and blocks on it. Never call it from a task running on that same runtime.

use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use custos_core::{ExpectedVersion, StreamId};
use custos_events::{EventMetadata, RecordedEvent};

use super::r#trait::{EventStore, EventStoreError, UncommittedEvent, validate_batch};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS custos_events (
    global_position BIGSERIAL PRIMARY KEY,
    event_id UUID NOT NULL UNIQUE,
    stream_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    version BIGINT NOT NULL CHECK (version > 0),
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    metadata JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (stream_id, version)
)
"#;

/// Postgres-backed append-only event store.
///
/// The unique constraint on `(stream_id, version)` turns a lost race between the
/// version check and the insert into a concurrency error.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the events table if it does not exist.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    pub async fn load_stream_async(&self, stream_id: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, stream_id, aggregate_type, version, event_type, payload, metadata
            FROM custos_events
            WHERE stream_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(recorded_from_row).collect()
    }

    #[instrument(
        skip(self, events),
        fields(stream_id = %stream_id, event_count = events.len(), expected_version = ?expected_version),
        err
    )]
    pub async fn append_async(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let aggregate_type = validate_batch(stream_id, &events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current, existing_type) = check_stream_version(&mut tx, stream_id).await?;

        if let Some(existing) = existing_type.filter(|t| t != &aggregate_type) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
            )));
        }

        if !expected_version.matches(current) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "stream {stream_id}: expected {expected_version:?}, found {current}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        for (event, version) in events.into_iter().zip(current + 1..) {
            let metadata = serde_json::to_value(&event.metadata)
                .map_err(|e| EventStoreError::InvalidAppend(format!("metadata serialization failed: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO custos_events
                    (event_id, stream_id, aggregate_type, version, event_type, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.event_id)
            .bind(stream_id.as_str())
            .bind(&event.aggregate_type)
            .bind(version as i64)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(event.record(version));
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.runtime.block_on(self.append_async(stream, events, expected_version))
    }

    fn load_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.runtime.block_on(self.load_stream_async(stream))
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &StreamId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(version), 0) AS current_version, MAX(aggregate_type) AS aggregate_type
        FROM custos_events
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Backend(format!("failed to read current_version: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Backend(format!("failed to read aggregate_type: {e}")))?;

    Ok((current as u64, aggregate_type))
}

fn recorded_from_row(row: &sqlx::postgres::PgRow) -> Result<RecordedEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Backend(format!("failed to decode event row: {e}"));

    let stream_id: String = row.try_get("stream_id").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(decode)?;
    let metadata: EventMetadata = serde_json::from_value(metadata)
        .map_err(|e| EventStoreError::Backend(format!("malformed metadata: {e}")))?;

    Ok(RecordedEvent {
        event_id: row.try_get("event_id").map_err(decode)?,
        stream_id: StreamId::from(stream_id),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        version: version as u64,
        payload: row.try_get("payload").map_err(decode)?,
        metadata,
    })
}

/// Map SQLx errors to `EventStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Backend(format!("connection pool closed in {operation}")),
        other => EventStoreError::Backend(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_is_a_backend_failure() {
        let err = map_sqlx_error("load_stream", sqlx::Error::PoolClosed);
        assert!(matches!(err, EventStoreError::Backend(msg) if msg.contains("load_stream")));
    }

    #[test]
    fn schema_guards_stream_versions() {
        assert!(SCHEMA.contains("UNIQUE (stream_id, version)"));
        assert!(SCHEMA.contains("CHECK (version > 0)"));
    }
}
