//! Persistent-subscription contract (mechanics only).
//!
//! A persistent subscription is a **durable, named, shared consumer group** over the
//! event log. Several workers join the same group; each delivery goes to exactly one of
//! them, and the group's cursor advances only when deliveries are settled.
//!
//! ## Delivery Guarantees
//!
//! Delivery is **at-least-once**: a crash before `ack`, or a `nack` with
//! [`NackAction::Retry`], causes redelivery. Every consumer must be idempotent.
//!
//! Ordering is guaranteed only within one aggregate's stream, never across streams.
//!
//! ## Settling a Delivery
//!
//! - `ack` marks the event processed.
//! - `nack(.., Retry)` puts it back for redelivery.
//! - `nack(.., Park)` moves it to a dead-letter set for manual triage. A parked event
//!   never blocks the cursor for the rest of the group.
//!
//! ## Dropped Subscriptions
//!
//! [`SubscriptionError::Dropped`] from `receive` means the broker connection is gone.
//! It is fatal: the worker pool stops rather than reconnecting locally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::envelope::RecordedEvent;

/// What to do with an event the consumer could not process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NackAction {
    Retry,
    Park,
}

/// One delivery of one event to one group member.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-specific handle used to settle this delivery.
    pub delivery_id: String,
    pub event: RecordedEvent,
    /// How many times this event was handed out before this delivery.
    pub retry_count: u32,
}

/// An event removed from the active queue after failing projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ParkedEvent {
    pub event: RecordedEvent,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription dropped: {0}")]
    Dropped(String),

    #[error("failed to connect to consumer group: {0}")]
    Connect(String),

    #[error("failed to settle delivery {delivery_id}: {reason}")]
    Settle { delivery_id: String, reason: String },
}

/// A worker's membership in a consumer group.
pub trait PersistentSubscription: Send + Sync {
    /// Wait up to `timeout` for the next delivery. `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, SubscriptionError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), SubscriptionError>;

    fn nack(&self, delivery: &Delivery, reason: &str, action: NackAction) -> Result<(), SubscriptionError>;
}

/// Joins workers to a named consumer group.
pub trait SubscriptionSource: Send + Sync {
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn PersistentSubscription>, SubscriptionError>;
}

impl<S> SubscriptionSource for Arc<S>
where
    S: SubscriptionSource + ?Sized,
{
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn PersistentSubscription>, SubscriptionError> {
        (**self).connect(group, worker)
    }
}

/// Makes appended events visible to subscribers.
///
/// Events are **stored first**, then published. If publication fails the events are
/// still in the store and can be republished.
pub trait EventPublisher: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, event: &RecordedEvent) -> Result<(), Self::Error>;
}

impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    type Error = P::Error;

    fn publish(&self, event: &RecordedEvent) -> Result<(), Self::Error> {
        (**self).publish(event)
    }
}
