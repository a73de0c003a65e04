//! Storage-agnostic read-model records and write descriptions.
//!
//! Projectors never issue queries. They describe a mutation ([`EntityMerge`],
//! [`Relation`], [`RelatedItem`], [`ActionEntry`]) and the store decides how to persist
//! it. The merge rules below are the only place field precedence is decided.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use custos_core::{EntityId, SOURCE_OPENLINE, SourceFields};

pub mod labels {
    pub const ORGANIZATION: &str = "Organization";
    pub const CONTACT: &str = "Contact";
    pub const CONTRACT: &str = "Contract";
    pub const SERVICE_LINE_ITEM: &str = "ServiceLineItem";
    pub const OPPORTUNITY: &str = "Opportunity";
    pub const INVOICE: &str = "Invoice";
    pub const INVOICE_LINE: &str = "InvoiceLine";
}

pub mod relations {
    /// Organization → Contract.
    pub const HAS_CONTRACT: &str = "HAS_CONTRACT";
    /// Organization/Contract → Opportunity.
    pub const HAS_OPPORTUNITY: &str = "HAS_OPPORTUNITY";
    /// Contract → its single open renewal Opportunity.
    pub const ACTIVE_RENEWAL: &str = "ACTIVE_RENEWAL";
    /// Contract → ServiceLineItem.
    pub const HAS_SERVICE: &str = "HAS_SERVICE";
    /// Contact → Organization, carrying the job role.
    pub const WORKS_AT: &str = "WORKS_AT";
    /// Organization → parent Organization.
    pub const SUBSIDIARY_OF: &str = "SUBSIDIARY_OF";
    /// Contract → Invoice.
    pub const HAS_INVOICE: &str = "HAS_INVOICE";
    /// Invoice → InvoiceLine.
    pub const HAS_LINE: &str = "HAS_LINE";
}

/// Address of one read-model entity within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub label: String,
    pub id: EntityId,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, id: EntityId) -> Self {
        Self {
            label: label.into(),
            id,
        }
    }
}

/// A projected entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub label: String,
    pub id: EntityId,
    pub fields: Map<String, Value>,
    /// Source that currently owns the record's sourced fields.
    pub source_of_truth: String,
    /// Created by a reference before its own create event arrived.
    pub placeholder: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(label: impl Into<String>, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            label: label.into(),
            id,
            fields: Map::new(),
            source_of_truth: String::new(),
            placeholder: false,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn placeholder(label: impl Into<String>, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            placeholder: true,
            ..Self::new(label, id, now)
        }
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::new(self.label.clone(), self.id)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !is_empty_value(v))
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Apply a merge to this record in place.
    ///
    /// `created` tells whether the record did not exist before the merge.
    pub fn apply_merge(&mut self, merge: &EntityMerge, created: bool, now: DateTime<Utc>) -> BTreeSet<String> {
        let was_placeholder = self.placeholder;
        let fill_only = merge
            .source
            .as_ref()
            .is_some_and(|s| SourceFields::fill_only(&self.source_of_truth, s));

        let mut changed = BTreeSet::new();
        for write in &merge.writes {
            let stored = self.fields.get(&write.name);
            let stored_empty = stored.is_none_or(is_empty_value);
            let allowed = match write.policy {
                WritePolicy::Always => true,
                WritePolicy::Sourced => !fill_only || stored_empty,
                WritePolicy::SourcedCount => {
                    !fill_only || stored_empty || stored.and_then(Value::as_i64) == Some(0)
                }
                WritePolicy::OnCreate => created || was_placeholder || stored_empty,
            };
            if allowed && stored != Some(&write.value) {
                self.fields.insert(write.name.clone(), write.value.clone());
                changed.insert(write.name.clone());
            }
        }

        if let Some(source) = &merge.source {
            if source.source == SOURCE_OPENLINE {
                self.source_of_truth = SOURCE_OPENLINE.to_string();
            } else if self.source_of_truth.is_empty() {
                self.source_of_truth = source.source_of_truth.clone();
            }
        }
        if merge.materializes {
            self.placeholder = false;
        }

        if !changed.is_empty() || was_placeholder != self.placeholder {
            self.updated_at = now;
        }
        changed
    }
}

/// Null, empty strings and empty collections count as "no value".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// How one field write interacts with the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePolicy {
    /// Source-of-truth rule: a non-internal writer may only fill an empty field once
    /// the internal source owns the record.
    Sourced,
    /// `Sourced` for counts, where a stored zero also counts as empty.
    SourcedCount,
    /// Derived or system fields. Always written.
    Always,
    /// Written on creation, over a placeholder, or into an empty field.
    OnCreate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub name: String,
    pub value: Value,
    pub policy: WritePolicy,
}

/// Merge-by-id upsert of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMerge {
    pub label: String,
    pub id: EntityId,
    /// Provenance of the write. `None` for system writes, which never change ownership.
    pub source: Option<SourceFields>,
    pub writes: Vec<FieldWrite>,
    /// Whether this merge turns a placeholder into a real record.
    pub materializes: bool,
}

impl EntityMerge {
    pub fn new(label: impl Into<String>, id: EntityId) -> Self {
        Self {
            label: label.into(),
            id,
            source: None,
            writes: Vec::new(),
            materializes: false,
        }
    }

    /// A create or update coming from the entity's own stream.
    pub fn from_source(label: impl Into<String>, id: EntityId, source: &SourceFields) -> Self {
        Self {
            source: Some(source.clone()),
            materializes: true,
            ..Self::new(label, id)
        }
        .on_create("source", Value::String(source.source.clone()))
        .on_create("app_source", Value::String(source.app_source.clone()))
    }

    fn push(mut self, name: &str, value: Value, policy: WritePolicy) -> Self {
        self.writes.push(FieldWrite {
            name: name.to_string(),
            value,
            policy,
        });
        self
    }

    pub fn sourced(self, name: &str, value: Value) -> Self {
        self.push(name, value, WritePolicy::Sourced)
    }

    /// Sourced write guarded by a mask predicate.
    pub fn sourced_if(self, include: bool, name: &str, value: Value) -> Self {
        if include { self.sourced(name, value) } else { self }
    }

    pub fn sourced_count_if(self, include: bool, name: &str, count: i64) -> Self {
        if include {
            self.push(name, Value::from(count), WritePolicy::SourcedCount)
        } else {
            self
        }
    }

    pub fn always(self, name: &str, value: Value) -> Self {
        self.push(name, value, WritePolicy::Always)
    }

    pub fn always_if(self, include: bool, name: &str, value: Value) -> Self {
        if include { self.always(name, value) } else { self }
    }

    pub fn on_create(self, name: &str, value: Value) -> Self {
        self.push(name, value, WritePolicy::OnCreate)
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::new(self.label.clone(), self.id)
    }
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub created: bool,
    pub changed: BTreeSet<String>,
    /// The record as it was before the merge.
    pub before: Option<EntityRecord>,
}

impl MergeOutcome {
    pub fn changed(&self, field: &str) -> bool {
        self.changed.contains(field)
    }

    pub fn any_changed(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.changed(f))
    }
}

/// Directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from: NodeRef,
    pub kind: String,
    pub to: NodeRef,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Relation {
    pub fn new(from: NodeRef, kind: impl Into<String>, to: NodeRef) -> Self {
        Self {
            from,
            kind: kind.into(),
            to,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub(crate) fn key(&self) -> (NodeRef, String, NodeRef) {
        (self.from.clone(), self.kind.clone(), self.to.clone())
    }
}

/// One child entity of a multi-item replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub label: String,
    pub id: EntityId,
    pub fields: Map<String, Value>,
}

/// Immutable timeline entry attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Id of the event that caused the entry.
    pub id: Uuid,
    pub entity: NodeRef,
    pub action_type: String,
    pub content: String,
    pub metadata: Value,
    pub app_source: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn external() -> SourceFields {
        SourceFields::new("hubspot", "sync")
    }

    #[test]
    fn internal_source_overwrites_and_takes_ownership() {
        let id = EntityId::new();
        let mut record = EntityRecord::new(labels::ORGANIZATION, id, now());

        let first = EntityMerge::from_source(labels::ORGANIZATION, id, &external()).sourced("name", json!("Hub"));
        record.apply_merge(&first, true, now());
        assert_eq!(record.source_of_truth, "hubspot");

        let internal = EntityMerge::from_source(labels::ORGANIZATION, id, &SourceFields::openline("web"))
            .sourced("name", json!("Acme"));
        let changed = record.apply_merge(&internal, false, now());

        assert!(changed.contains("name"));
        assert_eq!(record.str_field("name"), Some("Acme"));
        assert_eq!(record.source_of_truth, SOURCE_OPENLINE);
    }

    #[test]
    fn external_source_only_fills_empty_fields_of_internal_records() {
        let id = EntityId::new();
        let mut record = EntityRecord::new(labels::ORGANIZATION, id, now());
        record.apply_merge(
            &EntityMerge::from_source(labels::ORGANIZATION, id, &SourceFields::openline("web"))
                .sourced("name", json!("Acme")),
            true,
            now(),
        );

        let sync = EntityMerge::from_source(labels::ORGANIZATION, id, &external())
            .sourced("name", json!("Acme Inc"))
            .sourced("website", json!("acme.io"));
        let changed = record.apply_merge(&sync, false, now());

        assert_eq!(changed, BTreeSet::from(["website".to_string()]));
        assert_eq!(record.str_field("name"), Some("Acme"));
        assert_eq!(record.source_of_truth, SOURCE_OPENLINE);
    }

    #[test]
    fn external_source_fills_zero_counts_only() {
        let id = EntityId::new();
        let mut record = EntityRecord::new(labels::ORGANIZATION, id, now());
        record.apply_merge(
            &EntityMerge::from_source(labels::ORGANIZATION, id, &SourceFields::openline("web"))
                .sourced_count_if(true, "employees", 0)
                .sourced("score", json!(0)),
            true,
            now(),
        );

        let sync = EntityMerge::from_source(labels::ORGANIZATION, id, &external())
            .sourced_count_if(true, "employees", 250)
            .sourced("score", json!(7));
        let changed = record.apply_merge(&sync, false, now());
        assert_eq!(changed, BTreeSet::from(["employees".to_string()]));
        assert_eq!(record.fields["employees"], json!(250));

        let again = EntityMerge::from_source(labels::ORGANIZATION, id, &external())
            .sourced_count_if(true, "employees", 300);
        assert!(record.apply_merge(&again, false, now()).is_empty());
        assert_eq!(record.fields["employees"], json!(250));
    }

    #[test]
    fn on_create_writes_fill_placeholders_but_not_real_records() {
        let id = EntityId::new();
        let mut record = EntityRecord::placeholder(labels::CONTRACT, id, now());

        let create = EntityMerge::from_source(labels::CONTRACT, id, &SourceFields::openline("web"))
            .on_create("created_by", json!("ana"));
        record.apply_merge(&create, false, now());
        assert!(!record.placeholder);
        assert_eq!(record.str_field("created_by"), Some("ana"));

        let again = EntityMerge::new(labels::CONTRACT, id).on_create("created_by", json!("bob"));
        assert!(record.apply_merge(&again, false, now()).is_empty());
        assert_eq!(record.str_field("created_by"), Some("ana"));
    }

    #[test]
    fn system_writes_do_not_materialize_placeholders() {
        let id = EntityId::new();
        let mut record = EntityRecord::placeholder(labels::ORGANIZATION, id, now());
        record.apply_merge(
            &EntityMerge::new(labels::ORGANIZATION, id).always("renewal_forecast_arr", json!(10.0)),
            false,
            now(),
        );
        assert!(record.placeholder);
        assert!(record.source_of_truth.is_empty());
    }

    #[test]
    fn unchanged_values_are_not_reported() {
        let id = EntityId::new();
        let mut record = EntityRecord::new(labels::OPPORTUNITY, id, now());
        let merge = EntityMerge::new(labels::OPPORTUNITY, id).always("amount", json!(100.0));
        assert!(!record.apply_merge(&merge, true, now()).is_empty());
        assert!(record.apply_merge(&merge, false, now()).is_empty());
    }

    #[test]
    fn emptiness() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("")));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
    }
}
