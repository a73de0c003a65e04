use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use custos_contact::{ContactEvent, ContactField, ContactFields, OrganizationLinked};
use custos_core::TenantId;
use custos_events::RecordedEvent;

use crate::read_model::{EntityMerge, NodeRef, ReadModelStore, Relation, labels, relations};

use super::{EventHandler, ProjectionError, decode, link_external};

/// Projects contact profiles and their job roles at organizations.
pub struct ContactProjector {
    read_model: Arc<dyn ReadModelStore>,
}

impl ContactProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>) -> Self {
        Self { read_model }
    }

    pub fn event_types() -> &'static [&'static str] {
        ContactEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    /// The organization may not be projected yet; it starts as a placeholder.
    fn link_organization(&self, tenant: &TenantId, contact: NodeRef, e: &OrganizationLinked) -> Result<(), ProjectionError> {
        let organization = NodeRef::new(labels::ORGANIZATION, e.organization_id);
        if self.store().ensure_placeholder(tenant, &organization)? {
            debug!(%tenant, organization_id = %e.organization_id, "organization placeholder created for job role");
        }
        let role = &e.job_role;
        self.store().relate(
            tenant,
            Relation::new(contact, relations::WORKS_AT, organization)
                .with_property("job_title", json!(role.job_title))
                .with_property("description", json!(role.description))
                .with_property("primary", json!(role.primary))
                .with_property("started_at", json!(role.started_at))
                .with_property("ended_at", json!(role.ended_at))
                .with_property("source", json!(e.source.source)),
        )?;
        Ok(())
    }
}

fn field_name(field: ContactField) -> &'static str {
    match field {
        ContactField::FirstName => "first_name",
        ContactField::LastName => "last_name",
        ContactField::Name => "name",
        ContactField::Prefix => "prefix",
        ContactField::Description => "description",
        ContactField::Timezone => "timezone",
        ContactField::ProfilePhotoUrl => "profile_photo_url",
        ContactField::Username => "username",
    }
}

fn profile(merge: EntityMerge, fields: &ContactFields, include: impl Fn(ContactField) -> bool) -> EntityMerge {
    ContactField::ALL.into_iter().fold(merge, |merge, field| {
        merge.sourced_if(include(field), field_name(field), json!(fields.get(field)))
    })
}

impl EventHandler for ContactProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<ContactEvent>(event)? else {
            return Ok(());
        };
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::CONTACT, id);

        match env.payload() {
            ContactEvent::Created(e) => {
                let merge = EntityMerge::from_source(labels::CONTACT, id, &e.source)
                    .on_create("created_by", json!(env.metadata().user_id));
                self.store().merge(tenant, profile(merge, &e.fields, |_| true))?;
                link_external(self.store(), tenant, &node, &e.external_system)?;
            }
            ContactEvent::Updated(e) => {
                let merge = EntityMerge::from_source(labels::CONTACT, id, &e.source);
                self.store().merge(tenant, profile(merge, &e.fields, |f| e.mask.includes(f)))?;
                link_external(self.store(), tenant, &node, &e.external_system)?;
            }
            ContactEvent::OrganizationLinked(e) => self.link_organization(tenant, node, e)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use custos_contact::{ContactCreated, ContactUpdated, JobRole};
    use custos_core::{EntityId, ExternalSystem, FieldMask, SOURCE_OPENLINE, SourceFields};

    use super::*;
    use crate::projections::testing::{Harness, recorded, tenant};
    use crate::read_model::{ContactView, queries};

    fn projector(h: &Harness) -> ContactProjector {
        ContactProjector::new(h.store.clone())
    }

    fn contact(h: &Harness, id: EntityId) -> ContactView {
        queries::contact(h.store.as_ref(), &tenant(), id).unwrap().unwrap().view
    }

    fn created(external_system: ExternalSystem) -> ContactEvent {
        ContactEvent::Created(ContactCreated {
            fields: ContactFields {
                first_name: "Ana".into(),
                last_name: "Pop".into(),
                timezone: "Europe/Bucharest".into(),
                ..Default::default()
            },
            source: SourceFields::openline("web"),
            external_system,
        })
    }

    fn updated(fields: ContactFields, mask: &[ContactField], source: SourceFields) -> ContactEvent {
        ContactEvent::Updated(ContactUpdated {
            fields,
            mask: FieldMask::only(mask.iter().copied()),
            source,
            external_system: ExternalSystem::default(),
        })
    }

    #[test]
    fn masked_update_leaves_other_fields_alone() {
        let h = Harness::new();
        let p = projector(&h);
        let id = EntityId::new();
        p.handle(&recorded("contact", id, 1, created(ExternalSystem::default()))).unwrap();

        let fields = ContactFields {
            last_name: "Popescu".into(),
            ..Default::default()
        };
        p.handle(&recorded(
            "contact",
            id,
            2,
            updated(fields, &[ContactField::LastName], SourceFields::openline("web")),
        ))
        .unwrap();

        let view = contact(&h, id);
        assert_eq!(view.last_name, "Popescu");
        assert_eq!(view.first_name, "Ana");
        assert_eq!(view.timezone, "Europe/Bucharest");
    }

    #[test]
    fn external_sync_only_fills_empty_fields() {
        let h = Harness::new();
        let p = projector(&h);
        let id = EntityId::new();
        p.handle(&recorded("contact", id, 1, created(ExternalSystem::default()))).unwrap();

        let sync = ContactFields {
            first_name: "Anna".into(),
            username: "ana.pop".into(),
            ..Default::default()
        };
        p.handle(&recorded(
            "contact",
            id,
            2,
            updated(
                sync,
                &[ContactField::FirstName, ContactField::Username],
                SourceFields::new("hubspot", "sync"),
            ),
        ))
        .unwrap();

        let loaded = queries::contact(h.store.as_ref(), &tenant(), id).unwrap().unwrap();
        assert_eq!(loaded.view.first_name, "Ana");
        assert_eq!(loaded.view.username, "ana.pop");
        assert_eq!(loaded.record.source_of_truth, SOURCE_OPENLINE);
    }

    #[test]
    fn created_contact_is_linked_to_its_external_record() {
        let h = Harness::new();
        let p = projector(&h);
        let id = EntityId::new();
        let external = ExternalSystem {
            external_system_id: "hubspot".into(),
            external_id: "c-42".into(),
            ..Default::default()
        };
        p.handle(&recorded("contact", id, 1, created(external.clone()))).unwrap();

        let links = h
            .store
            .external_links(&tenant(), &NodeRef::new(labels::CONTACT, id))
            .unwrap();
        assert_eq!(links, vec![external]);
    }

    #[test]
    fn job_role_before_the_organization_creates_a_placeholder() {
        let h = Harness::new();
        let p = projector(&h);
        let id = EntityId::new();
        let org = EntityId::new();
        p.handle(&recorded("contact", id, 1, created(ExternalSystem::default()))).unwrap();

        let link = ContactEvent::OrganizationLinked(OrganizationLinked {
            organization_id: org,
            job_role: JobRole {
                job_title: "CTO".into(),
                primary: true,
                ..Default::default()
            },
            source: SourceFields::openline("web"),
        });
        p.handle(&recorded("contact", id, 2, link.clone())).unwrap();
        // Redelivery leaves a single edge.
        p.handle(&recorded("contact", id, 2, link)).unwrap();

        let placeholder = h
            .store
            .get(&tenant(), &NodeRef::new(labels::ORGANIZATION, org))
            .unwrap()
            .unwrap();
        assert!(placeholder.placeholder);

        let roles = h
            .store
            .related(&tenant(), &NodeRef::new(labels::CONTACT, id), relations::WORKS_AT)
            .unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].properties["job_title"], json!("CTO"));
        assert_eq!(roles[0].properties["primary"], json!(true));

        let contacts = queries::contacts_of(h.store.as_ref(), &tenant(), org).unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id(), id);
    }
}
