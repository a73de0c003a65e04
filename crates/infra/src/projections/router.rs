use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use custos_events::RecordedEvent;

use super::{EventHandler, ProjectionError};

/// Routing table from event type to projector.
///
/// Types in the ignore set are accepted without projection. Any other unrouted type
/// is an [`ProjectionError::InvalidEventType`], which parks the event.
#[derive(Default, Clone)]
pub struct EventRouter {
    routes: HashMap<String, Arc<dyn EventHandler>>,
    ignored: BTreeSet<String>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every type in `event_types` to `handler`. A later registration for the
    /// same type replaces the earlier one.
    pub fn route(mut self, event_types: &[&str], handler: Arc<dyn EventHandler>) -> Self {
        for event_type in event_types {
            self.routes.insert((*event_type).to_string(), Arc::clone(&handler));
        }
        self
    }

    pub fn ignore(mut self, event_type: impl Into<String>) -> Self {
        self.ignored.insert(event_type.into());
        self
    }

    pub fn is_routed(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    pub fn dispatch(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        if let Some(handler) = self.routes.get(&event.event_type) {
            return handler.handle(event);
        }
        if self.ignored.contains(&event.event_type) {
            debug!(event_type = %event.event_type, event_id = %event.event_id, "event type ignored");
            return Ok(());
        }
        Err(ProjectionError::InvalidEventType(event.event_type.clone()))
    }
}

impl core::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut routes: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        routes.sort_unstable();
        f.debug_struct("EventRouter")
            .field("routes", &routes)
            .field("ignored", &self.ignored)
            .finish()
    }
}

impl EventHandler for EventRouter {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        self.dispatch(event)
    }
}
