use std::collections::HashMap;
use std::sync::RwLock;

use custos_core::{ExpectedVersion, StreamId};
use custos_events::RecordedEvent;

use super::r#trait::{EventStore, EventStoreError, UncommittedEvent, validate_batch};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<RecordedEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event across all streams (test helper for replay checks).
    pub fn all_events(&self) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;
        Ok(streams.values().flatten().cloned().collect())
    }

    fn current_version(stream: &[RecordedEvent]) -> u64 {
        stream.last().map(|e| e.version).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let aggregate_type = validate_batch(stream_id, &events)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        let stream = streams.entry(stream_id.clone()).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {stream_id}: expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<RecordedEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, version)| e.record(version))
            .collect();
        stream.extend(committed.iter().cloned());

        Ok(committed)
    }

    fn load_stream(&self, stream_id: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(streams.get(stream_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::{EntityId, TenantId};
    use custos_events::EventMetadata;
    use serde_json::json;

    fn event(stream: &StreamId, tenant: &TenantId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: uuid::Uuid::now_v7(),
            stream_id: stream.clone(),
            aggregate_type: "contract".into(),
            event_type: "contract.updated".into(),
            payload: json!({}),
            metadata: EventMetadata::new(tenant.clone(), "test"),
        }
    }

    #[test]
    fn versions_are_assigned_consecutively() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::new("acme");
        let stream = StreamId::for_entity("contract", &tenant, &EntityId::new());

        let first = store
            .append(&stream, vec![event(&stream, &tenant), event(&stream, &tenant)], ExpectedVersion::Exact(0))
            .unwrap();
        let second = store
            .append(&stream, vec![event(&stream, &tenant)], ExpectedVersion::Exact(2))
            .unwrap();

        assert_eq!(first.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second[0].version, 3);
        assert_eq!(store.load_stream(&stream).unwrap().len(), 3);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::new("acme");
        let stream = StreamId::for_entity("contract", &tenant, &EntityId::new());
        store
            .append(&stream, vec![event(&stream, &tenant)], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(&stream, vec![event(&stream, &tenant)], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn foreign_tenant_cannot_append_to_a_stream() {
        let store = InMemoryEventStore::new();
        let owner = TenantId::new("acme");
        let stream = StreamId::for_entity("contract", &owner, &EntityId::new());

        let err = store
            .append(&stream, vec![event(&stream, &TenantId::new("globex"))], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::TenantIsolation(_)));
    }

    #[test]
    fn missing_stream_loads_empty() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("contract-acme-nothing");
        assert!(store.load_stream(&stream).unwrap().is_empty());
    }
}
