use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use custos_core::{ExpectedVersion, StreamId};
use custos_events::{Event, EventMetadata, RecordedEvent};

/// An event ready to be appended to a stream (not yet assigned a version).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by an aggregate's `handle()`
/// 2. **UncommittedEvent**: encoded payload plus metadata stamped from the command
/// 3. **RecordedEvent**: persisted with its stream version, then published
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
}

impl UncommittedEvent {
    /// Encode a typed domain event for appending.
    pub fn from_typed<E: Event>(
        stream_id: StreamId,
        aggregate_type: impl Into<String>,
        event: &E,
        metadata: EventMetadata,
    ) -> Result<Self, EventStoreError> {
        let payload = event
            .encode()
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            stream_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            payload,
            metadata,
        })
    }

    pub(crate) fn record(self, version: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: self.event_id,
            stream_id: self.stream_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            version,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only event store, one stream per aggregate instance.
///
/// ## Append Semantics
///
/// `append()`:
/// - requires every event in the batch to target `stream`
/// - requires each event's tenant to own the stream
/// - checks optimistic concurrency against the current stream version
/// - assigns versions starting at `current_version + 1`
/// - persists the batch atomically (all or nothing)
///
/// ## Load Semantics
///
/// `load_stream()` returns the stream in version order, or an empty vector when the
/// stream does not exist yet.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    fn load_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        (**self).append(stream, events, expected_version)
    }

    fn load_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        (**self).load_stream(stream)
    }
}

/// Batch checks shared by every backend. Returns the batch's aggregate type.
pub(crate) fn validate_batch(stream: &StreamId, events: &[UncommittedEvent]) -> Result<String, EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(String::new());
    };
    let aggregate_type = first.aggregate_type.clone();

    for (idx, e) in events.iter().enumerate() {
        if &e.stream_id != stream {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains an event for stream {} (index {idx})",
                e.stream_id
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
        if stream.entity_id(&aggregate_type, &e.metadata.tenant).is_err() {
            return Err(EventStoreError::TenantIsolation(format!(
                "tenant {} does not own stream {stream} (index {idx})",
                e.metadata.tenant
            )));
        }
    }
    Ok(aggregate_type)
}
