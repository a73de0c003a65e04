use uuid::Uuid;

use custos_core::{EntityId, TenantId, UserId};

/// Routing and attribution data shared by every command.
///
/// The dispatcher copies these fields onto the metadata of each emitted event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BaseCommand {
    pub entity_id: EntityId,
    pub tenant: TenantId,
    pub user_id: Option<UserId>,
    pub app_source: String,
    pub causation_id: Option<Uuid>,
}

impl BaseCommand {
    pub fn new(tenant: TenantId, entity_id: EntityId, app_source: impl Into<String>) -> Self {
        Self {
            entity_id,
            tenant,
            user_id: None,
            app_source: app_source.into(),
            causation_id: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent** - a request to perform an action on an aggregate.
/// They are **transient** (not persisted) and are transformed into events (which are persisted).
///
/// ## Command vs Event
///
/// - **Command**: Intent to do something (e.g., "set the renewal likelihood to LOW")
/// - **Event**: Fact that something happened (e.g., "RenewalUpdated { likelihood: LOW }")
///
/// Commands are rejected if invalid (validation errors). Events represent accepted changes.
///
/// ## Aggregate Targeting
///
/// Every command exposes a [`BaseCommand`] naming the tenant and entity it targets, so
/// infrastructure can derive the stream id without knowing the command's shape. Each
/// command operates on one aggregate, which is also its transaction boundary.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn base(&self) -> &BaseCommand;
}
