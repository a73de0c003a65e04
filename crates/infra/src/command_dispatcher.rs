//! Command execution pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the aggregate's stream
//!   ↓
//! 2. Rehydrate (fold every stored event, skipping internal ones)
//!   ↓
//! 3. Handle (pure decision logic, produces events)
//!   ↓
//! 4. Stamp metadata from the command and append with ExpectedVersion::Exact
//!   ↓
//! 5. On a version conflict, go back to 1 (bounded)
//! ```
//!
//! Publication is the store's concern: wrap it in
//! [`PublishingEventStore`](crate::event_store::PublishingEventStore) to fan appended
//! events out to subscribers.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use custos_core::{Aggregate, DomainError, EntityId, ExpectedVersion, StreamId, TenantId};
use custos_events::{Command, DecodeError, Event, EventMetadata, RecordedEvent};

use crate::config::DispatchConfig;
use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command was rejected by the aggregate (validation, invariant, not found).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Every attempt lost the optimistic-concurrency race.
    #[error("version conflict on {stream} after {attempts} attempts")]
    Conflict { stream: StreamId, attempts: u32 },

    /// A stored event could not be decoded during rehydration.
    #[error("failed to decode stored event: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl DispatchError {
    /// Errors caused by the command itself rather than the infrastructure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, DispatchError::Domain(_))
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Each command operates on exactly one aggregate instance. Concurrent writers to the
/// same stream are serialized by the store's version check; the loser reloads and
/// re-decides up to [`DispatchConfig::max_conflict_retries`] times.
#[derive(Debug, Clone)]
pub struct CommandDispatcher<S> {
    store: S,
    config: DispatchConfig,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> CommandDispatcher<S> {
    /// Load, rehydrate, handle and append. Returns the committed events.
    ///
    /// `make_aggregate` builds the empty instance for the command's entity id. An empty
    /// decision is a successful no-op and appends nothing.
    #[instrument(
        skip(self, command, make_aggregate),
        fields(
            aggregate_type = A::AGGREGATE_TYPE,
            tenant = %command.base().tenant,
            entity_id = %command.base().entity_id,
        ),
        err
    )]
    pub fn dispatch<A>(
        &self,
        command: A::Command,
        make_aggregate: impl Fn(EntityId) -> A,
    ) -> Result<Vec<RecordedEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event,
    {
        let base = command.base().clone();
        let stream = StreamId::for_entity(A::AGGREGATE_TYPE, &base.tenant, &base.entity_id);
        let attempts = self.config.max_conflict_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let history = self.store.load_stream(&stream)?;
            let mut aggregate = make_aggregate(base.entity_id);
            rehydrate(&mut aggregate, &history)?;

            let decided = aggregate.handle(&command)?;
            if decided.is_empty() {
                debug!("command decided no events");
                return Ok(vec![]);
            }

            let metadata = EventMetadata::new(base.tenant.clone(), base.app_source.clone())
                .with_user(base.user_id)
                .caused_by(base.causation_id);
            let uncommitted = decided
                .iter()
                .map(|e| UncommittedEvent::from_typed(stream.clone(), A::AGGREGATE_TYPE, e, metadata.clone()))
                .collect::<Result<Vec<_>, _>>()?;

            match self
                .store
                .append(&stream, uncommitted, ExpectedVersion::Exact(aggregate.version()))
            {
                Ok(committed) => return Ok(committed),
                Err(EventStoreError::Concurrency(reason)) => {
                    warn!(%stream, attempt, %reason, "append conflict, reloading");
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(DispatchError::Conflict { stream, attempts })
    }

    /// Rebuild the current state of one aggregate without handling a command.
    pub fn load<A>(
        &self,
        tenant: &TenantId,
        entity_id: EntityId,
        make_aggregate: impl FnOnce(EntityId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: Event,
    {
        let stream = StreamId::for_entity(A::AGGREGATE_TYPE, tenant, &entity_id);
        let history = self.store.load_stream(&stream)?;
        let mut aggregate = make_aggregate(entity_id);
        rehydrate(&mut aggregate, &history)?;
        Ok(aggregate)
    }
}

/// Fold a stored stream into `aggregate`.
///
/// Each event must carry version `current + 1`. Internal event types bump the version
/// without touching state; unknown types fail.
pub fn rehydrate<A>(aggregate: &mut A, history: &[RecordedEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: Event,
{
    for stored in history {
        let expected = aggregate.version() + 1;
        if stored.version != expected {
            return Err(DomainError::invariant(format!(
                "stream {} out of order: expected version {expected}, found {}",
                stored.stream_id, stored.version
            ))
            .into());
        }

        match A::Event::decode(&stored.event_type, &stored.payload) {
            Ok(Some(event)) => aggregate.apply(&event),
            Ok(None) => aggregate.skip_internal(),
            Err(DecodeError::UnknownEventType(t)) => {
                return Err(DomainError::invalid_event_type(t).into());
            }
            Err(other) => return Err(other.into()),
        }
    }
    Ok(())
}
