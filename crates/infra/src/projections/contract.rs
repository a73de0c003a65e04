use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use custos_contract::{ContractCreated, ContractEvent, ContractField, ContractFields, ContractStatus, ContractUpdated};
use custos_events::{EventEnvelope, RecordedEvent};

use crate::cascade::{CascadeContext, CascadeOrchestrator};
use crate::read_model::{
    ContractView, EntityMerge, NodeRef, ReadModelStore, Relation, labels, queries, relations, view,
};

use super::{EventHandler, ProjectionError, decode, link_external};

/// Fields whose change moves the renewal date or the renewal ARR.
const RENEWAL_INPUTS: &[&str] = &["service_started_at", "length_in_months", "auto_renew", "ended_at"];

/// Projects contracts and drives everything that hangs off a contract's status and
/// renewal cycle.
pub struct ContractProjector {
    read_model: Arc<dyn ReadModelStore>,
    cascade: Arc<CascadeOrchestrator>,
}

impl ContractProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>, cascade: Arc<CascadeOrchestrator>) -> Self {
        Self { read_model, cascade }
    }

    pub fn event_types() -> &'static [&'static str] {
        ContractEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    fn created(&self, env: &EventEnvelope<ContractEvent>, e: &ContractCreated) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::CONTRACT, id);

        let merge = EntityMerge::from_source(labels::CONTRACT, id, &e.source)
            .always("organization_id", json!(e.organization_id))
            .on_create("created_by", json!(e.created_by));
        self.store().merge(tenant, contract_fields(merge, &e.fields, |_| true))?;
        self.store().relate(
            tenant,
            Relation::new(
                NodeRef::new(labels::ORGANIZATION, e.organization_id),
                relations::HAS_CONTRACT,
                node.clone(),
            ),
        )?;
        link_external(self.store(), tenant, &node, &e.external_system)?;

        let ctx = CascadeContext::from_envelope(env);
        let Some(change) = self.cascade.refresh_contract_status(&ctx, id)? else {
            return Ok(());
        };
        if e.fields.length_in_months > 0 && change.current != ContractStatus::Ended {
            self.cascade.create_renewal(&ctx, id);
        }
        self.cascade.recompute_onboarding(&ctx, &change)?;
        Ok(())
    }

    fn updated(&self, env: &EventEnvelope<ContractEvent>, e: &ContractUpdated) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let ctx = CascadeContext::from_envelope(env);

        let merge = EntityMerge::from_source(labels::CONTRACT, id, &e.source);
        let outcome = self
            .store()
            .merge(tenant, contract_fields(merge, &e.fields, |f| e.mask.includes(f)))?;
        let before = outcome.before.as_ref().map(view::<ContractView>).transpose()?;

        let Some(change) = self.cascade.refresh_contract_status(&ctx, id)? else {
            return Ok(());
        };
        if change.changed() {
            self.cascade.update_relationship_if_churned(&ctx, &change)?;
        }

        link_external(self.store(), tenant, &NodeRef::new(labels::CONTRACT, id), &e.external_system)?;

        let had_cycle = before.as_ref().is_some_and(ContractView::renews);
        let has_cycle = queries::contract(self.store(), tenant, id)?.is_some_and(|c| c.view.renews());
        match (had_cycle, has_cycle) {
            (true, false) => {
                self.cascade.suspend_renewal(&ctx, id, change.organization_id)?;
            }
            (false, true) => {
                if change.current != ContractStatus::Ended {
                    self.cascade.create_renewal(&ctx, id);
                }
            }
            _ if outcome.any_changed(RENEWAL_INPUTS) => self.cascade.renewal_date_and_arr(&ctx, id)?,
            _ => {}
        }

        self.cascade
            .record_status_action(&ctx, &change, &env.metadata().app_source)?;
        if outcome.changed("ended_at") {
            self.cascade.renewal_likelihood(&ctx, id)?;
        }
        self.cascade.recompute_onboarding(&ctx, &change)?;
        Ok(())
    }

    fn status_refresh(&self, env: &EventEnvelope<ContractEvent>) -> Result<(), ProjectionError> {
        let id = env.entity_id();
        let ctx = CascadeContext::from_envelope(env);
        let Some(change) = self.cascade.refresh_contract_status(&ctx, id)? else {
            return Ok(());
        };
        if !change.changed() {
            return Ok(());
        }
        self.cascade.update_relationship_if_churned(&ctx, &change)?;
        self.cascade
            .record_status_action(&ctx, &change, &env.metadata().app_source)?;
        if change.current == ContractStatus::Ended {
            self.cascade.renewal_date_and_arr(&ctx, id)?;
        }
        self.cascade.recompute_onboarding(&ctx, &change)?;
        Ok(())
    }

    fn deleted(&self, env: &EventEnvelope<ContractEvent>) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let organization_id = queries::contract(self.store(), tenant, id)?.and_then(|c| c.view.organization_id);

        self.store().soft_delete(tenant, &NodeRef::new(labels::CONTRACT, id))?;
        debug!(%tenant, contract_id = %id, "contract soft-deleted");

        if let Some(org) = organization_id {
            let ctx = CascadeContext::from_envelope(env);
            self.cascade.refresh_renewal_summary(&ctx, org);
            self.cascade.refresh_arr(&ctx, org);
        }
        Ok(())
    }
}

/// Sourced contract writes for every field `include` accepts.
fn contract_fields(merge: EntityMerge, f: &ContractFields, include: impl Fn(ContractField) -> bool) -> EntityMerge {
    merge
        .sourced_if(include(ContractField::Name), "name", json!(f.name))
        .sourced_if(include(ContractField::ContractUrl), "contract_url", json!(f.contract_url))
        .sourced_if(include(ContractField::ServiceStartedAt), "service_started_at", json!(f.service_started_at))
        .sourced_if(include(ContractField::SignedAt), "signed_at", json!(f.signed_at))
        .sourced_if(include(ContractField::EndedAt), "ended_at", json!(f.ended_at))
        .sourced_if(include(ContractField::LengthInMonths), "length_in_months", json!(f.length_in_months))
        .sourced_if(include(ContractField::BillingCycle), "billing_cycle_in_months", json!(f.billing_cycle_in_months))
        .sourced_if(include(ContractField::Currency), "currency", json!(f.currency))
        .sourced_if(include(ContractField::Approved), "approved", json!(f.approved))
        .sourced_if(include(ContractField::AutoRenew), "auto_renew", json!(f.auto_renew))
        .sourced_if(include(ContractField::InvoicingEnabled), "invoicing_enabled", json!(f.invoicing_enabled))
}

impl EventHandler for ContractProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<ContractEvent>(event)? else {
            return Ok(());
        };
        match env.payload() {
            ContractEvent::Created(e) => self.created(&env, e),
            ContractEvent::Updated(e) => self.updated(&env, e),
            ContractEvent::Deleted(_) => self.deleted(&env),
            ContractEvent::StatusRefreshRequested(_) => self.status_refresh(&env),
        }
    }
}
