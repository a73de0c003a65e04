use custos_core::TenantId;

use crate::{EventEnvelope, RecordedEvent};

/// Helper trait for tenant-scoped messages.
///
/// Projectors read the tenant from the event, never from ambient state, so one worker
/// can serve every tenant sharing the subscription.
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> &TenantId {
        &self.metadata().tenant
    }
}

impl TenantScoped for RecordedEvent {
    fn tenant_id(&self) -> &TenantId {
        &self.metadata.tenant
    }
}
