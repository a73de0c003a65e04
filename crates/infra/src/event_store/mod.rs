//! Append-only event store boundary.
//!
//! Streams are addressed by [`StreamId`](custos_core::StreamId). Backends: in-memory
//! (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, UncommittedEvent};

use custos_core::{ExpectedVersion, StreamId};
use custos_events::{EventPublisher, RecordedEvent};

/// Adapter that publishes committed events after a successful append.
///
/// This ensures the ordering invariant: **publish happens only after append succeeds**.
pub struct PublishingEventStore<S, P> {
    store: S,
    publisher: P,
}

impl<S, P> PublishingEventStore<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn into_parts(self) -> (S, P) {
        (self.store, self.publisher)
    }
}

impl<S, P> EventStore for PublishingEventStore<S, P>
where
    S: EventStore,
    P: EventPublisher,
{
    fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append(stream, events, expected_version)?;

        // 2) Publish (at-least-once; the events are already stored)
        for e in &committed {
            self.publisher
                .publish(e)
                .map_err(|err| EventStoreError::Publish(err.to_string()))?;
        }

        Ok(committed)
    }

    fn load_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.store.load_stream(stream)
    }
}
