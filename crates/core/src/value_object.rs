//! Value objects: equality by value, not identity.
//!
//! The provenance types here ([`SourceFields`], [`ExternalSystem`]) travel on every
//! create/update event and decide how competing writers are merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical internal source. Writes from this source always win.
pub const SOURCE_OPENLINE: &str = "openline";

/// App source stamped on commands issued by projection cascades.
pub const APP_SOURCE_SUBSCRIBERS: &str = "custos-subscribers";

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two instances with the
/// same attributes are the same value. To "modify" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Provenance of a write: where the data came from and who is authoritative for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFields {
    pub source: String,
    pub source_of_truth: String,
    pub app_source: String,
}

impl ValueObject for SourceFields {}

impl SourceFields {
    /// Build provenance for a write. An empty source means the internal source.
    pub fn new(source: impl Into<String>, app_source: impl Into<String>) -> Self {
        let source = source.into();
        let source = if source.trim().is_empty() {
            SOURCE_OPENLINE.to_string()
        } else {
            source
        };
        Self {
            source_of_truth: source.clone(),
            source,
            app_source: app_source.into(),
        }
    }

    pub fn openline(app_source: impl Into<String>) -> Self {
        Self::new(SOURCE_OPENLINE, app_source)
    }

    pub fn is_internal(&self) -> bool {
        self.source == SOURCE_OPENLINE
    }

    /// Aggregate-side source-of-truth rule.
    ///
    /// Returns `true` when the incoming write may only fill empty fields: the stored
    /// source of truth is internal and the incoming source is not.
    pub fn fill_only(stored_source_of_truth: &str, incoming: &SourceFields) -> bool {
        incoming.source != stored_source_of_truth && stored_source_of_truth == SOURCE_OPENLINE
    }
}

impl Default for SourceFields {
    fn default() -> Self {
        Self::openline("")
    }
}

/// Reference to the same entity in an externally synced system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSystem {
    pub external_system_id: String,
    pub external_id: String,
    pub external_id_second: String,
    pub external_url: String,
    pub external_source: String,
    pub sync_date: Option<DateTime<Utc>>,
}

impl ValueObject for ExternalSystem {}

impl ExternalSystem {
    /// Both the system and the id in that system are known.
    pub fn available(&self) -> bool {
        !self.external_system_id.is_empty() && !self.external_id.is_empty()
    }
}
