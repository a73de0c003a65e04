use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use custos_core::{ExternalSystem, TenantId};

use super::model::{ActionEntry, EntityMerge, EntityRecord, MergeOutcome, NodeRef, RelatedItem, Relation};
use super::store::{ReadModelError, ReadModelStore};

type EdgeKey = (NodeRef, String, NodeRef);

#[derive(Debug, Default)]
struct TenantGraph {
    entities: BTreeMap<NodeRef, EntityRecord>,
    relations: BTreeMap<EdgeKey, Relation>,
    external: BTreeMap<(NodeRef, String, String), ExternalSystem>,
    actions: BTreeMap<(NodeRef, Uuid), ActionEntry>,
}

impl TenantGraph {
    fn ensure(&mut self, node: &NodeRef) -> bool {
        if self.entities.contains_key(node) {
            return false;
        }
        self.entities
            .insert(node.clone(), EntityRecord::placeholder(node.label.clone(), node.id, Utc::now()));
        true
    }

    fn remove(&mut self, node: &NodeRef) {
        self.entities.remove(node);
        self.relations.retain(|(from, _, to), _| from != node && to != node);
        self.external.retain(|(owner, _, _), _| owner != node);
    }
}

/// In-memory read model, partitioned by tenant.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadModel {
    tenants: RwLock<HashMap<TenantId, TenantGraph>>,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, tenant: &TenantId, f: impl FnOnce(Option<&TenantGraph>) -> T) -> Result<T, ReadModelError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|_| ReadModelError::Backend("lock poisoned".to_string()))?;
        Ok(f(tenants.get(tenant)))
    }

    fn write<T>(&self, tenant: &TenantId, f: impl FnOnce(&mut TenantGraph) -> T) -> Result<T, ReadModelError> {
        let mut tenants = self
            .tenants
            .write()
            .map_err(|_| ReadModelError::Backend("lock poisoned".to_string()))?;
        Ok(f(tenants.entry(tenant.clone()).or_default()))
    }

    /// Number of edges stored for a tenant (test helper for idempotence checks).
    pub fn relation_count(&self, tenant: &TenantId) -> Result<usize, ReadModelError> {
        self.read(tenant, |g| g.map(|g| g.relations.len()).unwrap_or(0))
    }
}

impl ReadModelStore for InMemoryReadModel {
    fn merge(&self, tenant: &TenantId, merge: EntityMerge) -> Result<MergeOutcome, ReadModelError> {
        self.write(tenant, |graph| {
            let now = Utc::now();
            let node = merge.node();
            let before = graph.entities.get(&node).cloned();
            let created = before.is_none();
            let record = graph
                .entities
                .entry(node)
                .or_insert_with(|| EntityRecord::new(merge.label.clone(), merge.id, now));
            let changed = record.apply_merge(&merge, created, now);
            MergeOutcome {
                created,
                changed,
                before,
            }
        })
    }

    fn ensure_placeholder(&self, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError> {
        self.write(tenant, |graph| graph.ensure(node))
    }

    fn get(&self, tenant: &TenantId, node: &NodeRef) -> Result<Option<EntityRecord>, ReadModelError> {
        self.read(tenant, |g| g.and_then(|g| g.entities.get(node).cloned()))
    }

    fn list(&self, tenant: &TenantId, label: &str) -> Result<Vec<EntityRecord>, ReadModelError> {
        self.read(tenant, |g| {
            g.map(|g| {
                g.entities
                    .values()
                    .filter(|r| r.label == label)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn relate(&self, tenant: &TenantId, relation: Relation) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| {
            graph.ensure(&relation.from);
            graph.ensure(&relation.to);
            graph.relations.insert(relation.key(), relation);
        })
    }

    fn unrelate(&self, tenant: &TenantId, from: &NodeRef, kind: &str, to: &NodeRef) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| {
            graph
                .relations
                .remove(&(from.clone(), kind.to_string(), to.clone()));
        })
    }

    fn related(&self, tenant: &TenantId, from: &NodeRef, kind: &str) -> Result<Vec<Relation>, ReadModelError> {
        self.read(tenant, |g| {
            g.map(|g| {
                g.relations
                    .values()
                    .filter(|r| &r.from == from && r.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn related_from(&self, tenant: &TenantId, kind: &str, to: &NodeRef) -> Result<Vec<Relation>, ReadModelError> {
        self.read(tenant, |g| {
            g.map(|g| {
                g.relations
                    .values()
                    .filter(|r| &r.to == to && r.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn link_external(&self, tenant: &TenantId, node: &NodeRef, link: &ExternalSystem) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| {
            graph.ensure(node);
            graph.external.insert(
                (node.clone(), link.external_system_id.clone(), link.external_id.clone()),
                link.clone(),
            );
        })
    }

    fn external_links(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ExternalSystem>, ReadModelError> {
        self.read(tenant, |g| {
            g.map(|g| {
                g.external
                    .iter()
                    .filter(|((owner, _, _), _)| owner == node)
                    .map(|(_, link)| link.clone())
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn replace_related(
        &self,
        tenant: &TenantId,
        owner: &NodeRef,
        kind: &str,
        items: Vec<RelatedItem>,
    ) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| {
            let now = Utc::now();
            graph.ensure(owner);

            let keep: BTreeSet<NodeRef> = items.iter().map(|i| NodeRef::new(i.label.clone(), i.id)).collect();
            let stale: Vec<NodeRef> = graph
                .relations
                .values()
                .filter(|r| &r.from == owner && r.kind == kind && !keep.contains(&r.to))
                .map(|r| r.to.clone())
                .collect();
            for child in &stale {
                graph.remove(child);
            }

            for item in items {
                let node = NodeRef::new(item.label.clone(), item.id);
                let record = graph
                    .entities
                    .entry(node.clone())
                    .or_insert_with(|| EntityRecord::new(item.label.clone(), item.id, now));
                record.fields.extend(item.fields);
                record.placeholder = false;
                record.updated_at = now;

                let edge = Relation::new(owner.clone(), kind, node);
                graph.relations.insert(edge.key(), edge);
            }
        })
    }

    fn soft_delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| {
            if let Some(record) = graph.entities.get_mut(node) {
                if !record.deleted {
                    record.deleted = true;
                    record.updated_at = Utc::now();
                }
            }
        })
    }

    fn delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        self.write(tenant, |graph| graph.remove(node))
    }

    fn append_action(&self, tenant: &TenantId, action: ActionEntry) -> Result<bool, ReadModelError> {
        self.write(tenant, |graph| {
            let key = (action.entity.clone(), action.id);
            if graph.actions.contains_key(&key) {
                return false;
            }
            graph.actions.insert(key, action);
            true
        })
    }

    fn actions_for(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ActionEntry>, ReadModelError> {
        self.read(tenant, |g| {
            let mut actions: Vec<ActionEntry> = g
                .map(|g| {
                    g.actions
                        .iter()
                        .filter(|((entity, _), _)| entity == node)
                        .map(|(_, a)| a.clone())
                        .collect()
                })
                .unwrap_or_default();
            actions.sort_by_key(|a| a.created_at);
            actions
        })
    }
}
