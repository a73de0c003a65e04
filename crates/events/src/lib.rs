//! Event model, command contract and the persistent-subscription boundary.
//!
//! Everything here is transport-agnostic: brokers, stores and read models live in
//! `custos-infra` and implement the traits defined in this crate.

pub mod command;
pub mod envelope;
pub mod event;
pub mod in_memory_hub;
pub mod metadata;
pub mod subscription;
pub mod tenant;

pub use command::{BaseCommand, Command};
pub use envelope::{EventEnvelope, RecordedEvent};
pub use event::{DecodeError, Event, is_internal_event_type};
pub use in_memory_hub::{HubError, InMemorySubscription, InMemorySubscriptionHub};
pub use metadata::EventMetadata;
pub use subscription::{
    Delivery, EventPublisher, NackAction, ParkedEvent, PersistentSubscription, SubscriptionError,
    SubscriptionSource,
};
pub use tenant::TenantScoped;

#[doc(hidden)]
pub use serde_json as __serde_json;
