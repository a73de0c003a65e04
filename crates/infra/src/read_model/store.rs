use std::sync::Arc;

use thiserror::Error;

use custos_core::{EntityId, ExternalSystem, TenantId};

use super::model::{ActionEntry, EntityMerge, EntityRecord, MergeOutcome, NodeRef, RelatedItem, Relation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadModelError {
    #[error("read model backend failure: {0}")]
    Backend(String),

    #[error("malformed read model record {label}/{id}: {reason}")]
    Malformed {
        label: String,
        id: EntityId,
        reason: String,
    },
}

/// Tenant-isolated, storage-agnostic read-model boundary.
///
/// Every operation is an idempotent merge: applying the same call twice leaves the
/// store as applying it once. Concurrent workers write through this trait without any
/// entity-level lock.
pub trait ReadModelStore: Send + Sync {
    /// Create the record if absent, then apply the merge's field writes.
    fn merge(&self, tenant: &TenantId, merge: EntityMerge) -> Result<MergeOutcome, ReadModelError>;

    /// Create a minimal placeholder record if none exists. Returns whether one was created.
    fn ensure_placeholder(&self, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError>;

    fn get(&self, tenant: &TenantId, node: &NodeRef) -> Result<Option<EntityRecord>, ReadModelError>;

    fn list(&self, tenant: &TenantId, label: &str) -> Result<Vec<EntityRecord>, ReadModelError>;

    /// Upsert an edge. Missing endpoints are created as placeholders.
    fn relate(&self, tenant: &TenantId, relation: Relation) -> Result<(), ReadModelError>;

    fn unrelate(&self, tenant: &TenantId, from: &NodeRef, kind: &str, to: &NodeRef) -> Result<(), ReadModelError>;

    /// Outgoing edges of `kind`.
    fn related(&self, tenant: &TenantId, from: &NodeRef, kind: &str) -> Result<Vec<Relation>, ReadModelError>;

    /// Incoming edges of `kind`.
    fn related_from(&self, tenant: &TenantId, kind: &str, to: &NodeRef) -> Result<Vec<Relation>, ReadModelError>;

    /// Link to an external system record, keyed by `(external_system_id, external_id)`.
    fn link_external(&self, tenant: &TenantId, node: &NodeRef, link: &ExternalSystem) -> Result<(), ReadModelError>;

    fn external_links(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ExternalSystem>, ReadModelError>;

    /// Make `items` the complete set of `kind` children of `owner`.
    ///
    /// Every item is written in full; children no longer present are removed.
    fn replace_related(
        &self,
        tenant: &TenantId,
        owner: &NodeRef,
        kind: &str,
        items: Vec<RelatedItem>,
    ) -> Result<(), ReadModelError>;

    /// Flag a record deleted, keeping it for history. No-op when absent.
    fn soft_delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError>;

    /// Remove a record and its edges.
    fn delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError>;

    /// Record a timeline entry. Returns `false` when an entry with the same id exists.
    fn append_action(&self, tenant: &TenantId, action: ActionEntry) -> Result<bool, ReadModelError>;

    fn actions_for(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ActionEntry>, ReadModelError>;
}

impl<S> ReadModelStore for Arc<S>
where
    S: ReadModelStore + ?Sized,
{
    fn merge(&self, tenant: &TenantId, merge: EntityMerge) -> Result<MergeOutcome, ReadModelError> {
        (**self).merge(tenant, merge)
    }

    fn ensure_placeholder(&self, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError> {
        (**self).ensure_placeholder(tenant, node)
    }

    fn get(&self, tenant: &TenantId, node: &NodeRef) -> Result<Option<EntityRecord>, ReadModelError> {
        (**self).get(tenant, node)
    }

    fn list(&self, tenant: &TenantId, label: &str) -> Result<Vec<EntityRecord>, ReadModelError> {
        (**self).list(tenant, label)
    }

    fn relate(&self, tenant: &TenantId, relation: Relation) -> Result<(), ReadModelError> {
        (**self).relate(tenant, relation)
    }

    fn unrelate(&self, tenant: &TenantId, from: &NodeRef, kind: &str, to: &NodeRef) -> Result<(), ReadModelError> {
        (**self).unrelate(tenant, from, kind, to)
    }

    fn related(&self, tenant: &TenantId, from: &NodeRef, kind: &str) -> Result<Vec<Relation>, ReadModelError> {
        (**self).related(tenant, from, kind)
    }

    fn related_from(&self, tenant: &TenantId, kind: &str, to: &NodeRef) -> Result<Vec<Relation>, ReadModelError> {
        (**self).related_from(tenant, kind, to)
    }

    fn link_external(&self, tenant: &TenantId, node: &NodeRef, link: &ExternalSystem) -> Result<(), ReadModelError> {
        (**self).link_external(tenant, node, link)
    }

    fn external_links(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ExternalSystem>, ReadModelError> {
        (**self).external_links(tenant, node)
    }

    fn replace_related(
        &self,
        tenant: &TenantId,
        owner: &NodeRef,
        kind: &str,
        items: Vec<RelatedItem>,
    ) -> Result<(), ReadModelError> {
        (**self).replace_related(tenant, owner, kind, items)
    }

    fn soft_delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        (**self).soft_delete(tenant, node)
    }

    fn delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        (**self).delete(tenant, node)
    }

    fn append_action(&self, tenant: &TenantId, action: ActionEntry) -> Result<bool, ReadModelError> {
        (**self).append_action(tenant, action)
    }

    fn actions_for(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ActionEntry>, ReadModelError> {
        (**self).actions_for(tenant, node)
    }
}
