use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use custos_core::{EntityId, TenantId};
use custos_events::{EventEnvelope, RecordedEvent};
use custos_organization::{
    OnboardingStatusUpdated, OrganizationCreated, OrganizationEvent, OrganizationField, OrganizationFields,
};

use crate::cascade::renewal;
use crate::read_model::{
    ActionEntry, EntityMerge, NodeRef, ReadModelStore, Relation, labels, queries, relations,
};

use super::{EventHandler, ProjectionError, decode, link_external, to_value};

pub const ONBOARDING_STATUS_ACTION: &str = "ONBOARDING_STATUS_CHANGED";

/// Projects organization profiles, hierarchy, onboarding and derived renewal figures.
///
/// The two refresh events only recompute from the read model. They never cascade.
pub struct OrganizationProjector {
    read_model: Arc<dyn ReadModelStore>,
}

impl OrganizationProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>) -> Self {
        Self { read_model }
    }

    pub fn event_types() -> &'static [&'static str] {
        OrganizationEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    fn on_created(&self, env: &EventEnvelope<OrganizationEvent>, e: &OrganizationCreated) -> EntityMerge {
        let merge = EntityMerge::from_source(labels::ORGANIZATION, env.entity_id(), &e.source);
        profile(merge, &e.fields, |_| true).on_create("created_by", json!(env.metadata().user_id))
    }

    fn refresh_arr(&self, tenant: &TenantId, id: EntityId) -> Result<(), ProjectionError> {
        let renewals = queries::open_renewals_of(self.store(), tenant, id)?;
        let forecast = renewal::forecast(renewals.iter().map(|r| &r.view));
        self.store().merge(
            tenant,
            EntityMerge::new(labels::ORGANIZATION, id)
                .always("renewal_forecast_arr", json!(forecast.arr))
                .always("renewal_forecast_max_arr", json!(forecast.max_arr)),
        )?;
        debug!(%tenant, organization_id = %id, arr = forecast.arr, max_arr = forecast.max_arr, "renewal forecast refreshed");
        Ok(())
    }

    fn refresh_renewal_summary(&self, tenant: &TenantId, id: EntityId) -> Result<(), ProjectionError> {
        let renewals = queries::open_renewals_of(self.store(), tenant, id)?;
        let summary = renewal::renewal_summary(renewals.iter().map(|r| &r.view), Utc::now());
        self.store().merge(
            tenant,
            EntityMerge::new(labels::ORGANIZATION, id)
                .always("next_renewal_at", json!(summary.next_renewal_at))
                .always("renewal_likelihood", to_value(&summary.likelihood)?)
                .always("renewal_likelihood_order", json!(summary.likelihood_order)),
        )?;
        Ok(())
    }

    fn onboarding(
        &self,
        env: &EventEnvelope<OrganizationEvent>,
        e: &OnboardingStatusUpdated,
    ) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        self.store().merge(
            tenant,
            EntityMerge::new(labels::ORGANIZATION, id)
                .always("onboarding_status", to_value(&e.status)?)
                .always("onboarding_comments", json!(e.comments))
                .always("onboarding_updated_at", json!(env.metadata().created_at)),
        )?;

        let user = e.updated_by.map(|u| u.to_string());
        self.store().append_action(
            tenant,
            ActionEntry {
                id: env.event_id(),
                entity: NodeRef::new(labels::ORGANIZATION, id),
                action_type: ONBOARDING_STATUS_ACTION.to_string(),
                content: e.status.change_message(user.as_deref()),
                metadata: json!({
                    "status": e.status,
                    "comments": e.comments,
                    "user_id": e.updated_by,
                    "contract_id": e.caused_by_contract_id,
                }),
                app_source: env.metadata().app_source.clone(),
                created_at: env.metadata().created_at,
            },
        )?;
        Ok(())
    }
}

/// Sourced profile writes for every field `include` accepts.
fn profile(
    merge: EntityMerge,
    fields: &OrganizationFields,
    include: impl Fn(OrganizationField) -> bool,
) -> EntityMerge {
    merge
        .sourced_if(include(OrganizationField::Name), "name", json!(fields.name))
        .sourced_if(include(OrganizationField::Description), "description", json!(fields.description))
        .sourced_if(include(OrganizationField::Website), "website", json!(fields.website))
        .sourced_if(include(OrganizationField::Industry), "industry", json!(fields.industry))
        .sourced_count_if(include(OrganizationField::Employees), "employees", fields.employees)
        .sourced_if(include(OrganizationField::Relationship), "relationship", json!(fields.relationship))
        .sourced_if(include(OrganizationField::Stage), "stage", json!(fields.stage))
        .sourced_if(include(OrganizationField::Hide), "hide", json!(fields.hide))
}

impl EventHandler for OrganizationProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<OrganizationEvent>(event)? else {
            return Ok(());
        };
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::ORGANIZATION, id);

        match env.payload() {
            OrganizationEvent::Created(e) => {
                self.store().merge(tenant, self.on_created(&env, e))?;
                link_external(self.store(), tenant, &node, &e.external_system)?;
            }
            OrganizationEvent::Updated(e) => {
                let merge = EntityMerge::from_source(labels::ORGANIZATION, id, &e.source);
                self.store().merge(tenant, profile(merge, &e.fields, |f| e.mask.includes(f)))?;
                link_external(self.store(), tenant, &node, &e.external_system)?;
            }
            OrganizationEvent::ParentAdded(e) => {
                let parent = NodeRef::new(labels::ORGANIZATION, e.parent_id);
                self.store().relate(
                    tenant,
                    Relation::new(node, relations::SUBSIDIARY_OF, parent)
                        .with_property("relation_type", json!(e.relation_type)),
                )?;
            }
            OrganizationEvent::ParentRemoved(e) => {
                let parent = NodeRef::new(labels::ORGANIZATION, e.parent_id);
                self.store().unrelate(tenant, &node, relations::SUBSIDIARY_OF, &parent)?;
            }
            OrganizationEvent::OnboardingStatusUpdated(e) => self.onboarding(&env, e)?,
            OrganizationEvent::ArrRefreshed(_) => self.refresh_arr(tenant, id)?,
            OrganizationEvent::RenewalSummaryRefreshed(_) => self.refresh_renewal_summary(tenant, id)?,
        }
        Ok(())
    }
}
