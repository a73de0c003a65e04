use serde::{Deserialize, Serialize};
use uuid::Uuid;

use custos_core::{EntityId, StreamId};

use crate::event::{DecodeError, Event};
use crate::metadata::EventMetadata;

/// An event as it sits in the log: type-erased JSON payload plus stream coordinates.
///
/// This is the unit the store appends, the broker delivers and the router dispatches.
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub aggregate_type: String,
    pub event_type: String,
    /// Position in the stream, starting at 1.
    pub version: u64,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

impl RecordedEvent {
    /// Events on broker-internal streams carry no business data.
    pub fn is_internal(&self) -> bool {
        self.stream_id.is_internal()
    }

    pub fn entity_id(&self) -> Result<EntityId, DecodeError> {
        self.stream_id
            .entity_id(&self.aggregate_type, &self.metadata.tenant)
            .map_err(|e| DecodeError::InvalidStream(e.to_string()))
    }

    /// Decode into a typed envelope. `Ok(None)` for internal event types.
    pub fn decode<E: Event>(&self) -> Result<Option<EventEnvelope<E>>, DecodeError> {
        let Some(payload) = E::decode(&self.event_type, &self.payload)? else {
            return Ok(None);
        };
        Ok(Some(EventEnvelope {
            event_id: self.event_id,
            stream_id: self.stream_id.clone(),
            entity_id: self.entity_id()?,
            aggregate_type: self.aggregate_type.clone(),
            version: self.version,
            payload,
            metadata: self.metadata.clone(),
        }))
    }
}

/// Typed view of a [`RecordedEvent`].
///
/// Notes:
/// - **Multi-tenancy** travels in `metadata.tenant`.
/// - **Append-only**: `version` is monotonically increasing per stream.
/// - `entity_id` is the stream id with the aggregate type and tenant stripped, the
///   same id the read model uses.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    stream_id: StreamId,
    entity_id: EntityId,
    aggregate_type: String,
    version: u64,
    payload: E,
    metadata: EventMetadata,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        stream_id: StreamId,
        entity_id: EntityId,
        aggregate_type: impl Into<String>,
        version: u64,
        payload: E,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            entity_id,
            aggregate_type: aggregate_type.into(),
            version,
            payload,
            metadata,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::TenantId;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        n: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum PingEvent {
        Pinged(Pinged),
    }

    crate::impl_event_codec!(PingEvent { Pinged => "ping.pinged" });

    fn recorded(event_type: &str) -> RecordedEvent {
        let tenant = TenantId::new("acme");
        let id = EntityId::new();
        RecordedEvent {
            event_id: Uuid::now_v7(),
            stream_id: StreamId::for_entity("ping", &tenant, &id),
            aggregate_type: "ping".into(),
            event_type: event_type.into(),
            version: 1,
            payload: json!({"n": 7}),
            metadata: EventMetadata::new(tenant, "test"),
        }
    }

    #[test]
    fn decode_resolves_entity_id_from_stream() {
        let event = recorded("ping.pinged");
        let envelope = event.decode::<PingEvent>().unwrap().unwrap();
        assert_eq!(envelope.entity_id(), event.entity_id().unwrap());
        assert_eq!(envelope.payload(), &PingEvent::Pinged(Pinged { n: 7 }));
    }

    #[test]
    fn decode_skips_internal_types() {
        assert!(recorded("$settings").decode::<PingEvent>().unwrap().is_none());
    }
}
