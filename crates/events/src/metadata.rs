use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use custos_core::{TenantId, UserId};

/// Metadata stamped on every event at command time.
///
/// `causation_id` is the id of the event whose projection issued the command, when
/// the command came from a cascade. It lets a reader follow a chain of recomputations
/// back to the user action that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub tenant: TenantId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub app_source: String,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(tenant: TenantId, app_source: impl Into<String>) -> Self {
        Self {
            tenant,
            user_id: None,
            app_source: app_source.into(),
            causation_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn caused_by(mut self, causation_id: Option<Uuid>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether a person (rather than a system process) triggered the change.
    pub fn is_user_initiated(&self) -> bool {
        self.user_id.is_some()
    }
}
