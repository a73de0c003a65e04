//! Projectors: one per entity family, turning recorded events into read-model merges.
//!
//! Every projector is:
//! - **Rebuildable**: the read model can be reconstructed by replaying the log
//! - **Tenant-isolated**: every write is scoped by the event's tenant
//! - **Idempotent**: writes are merges by id, so redelivery leaves the same state
//!
//! Selected projectors follow up through the [`CascadeOrchestrator`](crate::cascade::CascadeOrchestrator)
//! after their own write succeeded. A follow-up command that fails is logged and does
//! not fail the projection; a read-model error while preparing one does.

pub mod contact;
pub mod contract;
pub mod invoice;
pub mod opportunity;
pub mod organization;
pub mod router;
pub mod service_line_item;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use custos_core::{ExternalSystem, TenantId};
use custos_events::{DecodeError, Event, EventEnvelope, RecordedEvent};

use crate::cascade::CascadeOrchestrator;
use crate::read_model::{NodeRef, ReadModelError, ReadModelStore};

pub use contact::ContactProjector;
pub use contract::ContractProjector;
pub use invoice::InvoiceProjector;
pub use opportunity::OpportunityProjector;
pub use organization::OrganizationProjector;
pub use router::EventRouter;
pub use service_line_item::ServiceLineItemProjector;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    #[error("failed to decode event: {0}")]
    Decode(DecodeError),

    #[error("read model write failed: {0}")]
    ReadModel(#[from] ReadModelError),

    #[error("failed to serialize projected value: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<DecodeError> for ProjectionError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::UnknownEventType(t) => ProjectionError::InvalidEventType(t),
            other => ProjectionError::Decode(other),
        }
    }
}

/// Applies one recorded event to the read model.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError>;
}

/// Event types that are accepted without projection.
pub const IGNORED_EVENT_TYPES: &[&str] = &["organization.renewal_forecast_requested"];

/// The routing table every subscriber runs: one projector per entity family.
pub fn projection_router(read_model: Arc<dyn ReadModelStore>, cascade: Arc<CascadeOrchestrator>) -> EventRouter {
    let router = EventRouter::new()
        .route(
            OrganizationProjector::event_types(),
            Arc::new(OrganizationProjector::new(read_model.clone())),
        )
        .route(
            ContactProjector::event_types(),
            Arc::new(ContactProjector::new(read_model.clone())),
        )
        .route(
            ContractProjector::event_types(),
            Arc::new(ContractProjector::new(read_model.clone(), cascade.clone())),
        )
        .route(
            ServiceLineItemProjector::event_types(),
            Arc::new(ServiceLineItemProjector::new(read_model.clone(), cascade.clone())),
        )
        .route(
            OpportunityProjector::event_types(),
            Arc::new(OpportunityProjector::new(read_model.clone(), cascade)),
        )
        .route(InvoiceProjector::event_types(), Arc::new(InvoiceProjector::new(read_model)));

    IGNORED_EVENT_TYPES
        .iter()
        .fold(router, |router, event_type| router.ignore(*event_type))
}

/// Typed decode for a family projector. Internal event types decode to `None`.
pub(crate) fn decode<E: Event>(event: &RecordedEvent) -> Result<Option<EventEnvelope<E>>, ProjectionError> {
    Ok(event.decode::<E>()?)
}

pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ProjectionError> {
    Ok(serde_json::to_value(value)?)
}

/// Link a node to its external record when the event carries one.
pub(crate) fn link_external(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    node: &NodeRef,
    external: &ExternalSystem,
) -> Result<(), ProjectionError> {
    if external.available() {
        store.link_external(tenant, node, external)?;
    }
    Ok(())
}
