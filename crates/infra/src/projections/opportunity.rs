use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use custos_core::FieldMask;
use custos_events::{EventEnvelope, RecordedEvent};
use custos_opportunity::{
    InternalStage, InternalType, OpportunityEvent, OpportunityField, OpportunityFields, RenewalCreated, RenewalField,
    RenewalUpdated,
};

use crate::cascade::{CascadeContext, CascadeOrchestrator};
use crate::read_model::{
    EntityMerge, NodeRef, OpportunityView, ReadModelStore, Relation, labels, queries, relations,
};

use super::{EventHandler, ProjectionError, decode, link_external, to_value};

/// Projects opportunities, new business and renewals alike, and keeps the owning
/// organization's renewal figures in step.
pub struct OpportunityProjector {
    read_model: Arc<dyn ReadModelStore>,
    cascade: Arc<CascadeOrchestrator>,
}

fn opportunity_fields(
    merge: EntityMerge,
    f: &OpportunityFields,
    mask: &FieldMask<OpportunityField>,
) -> Result<EntityMerge, ProjectionError> {
    use OpportunityField as F;
    Ok(merge
        .sourced_if(mask.includes(F::Name), "name", json!(f.name))
        .sourced_if(mask.includes(F::Amount), "amount", json!(f.amount))
        .sourced_if(mask.includes(F::MaxAmount), "max_amount", json!(f.max_amount))
        .sourced_if(mask.includes(F::InternalStage), "internal_stage", to_value(&f.internal_stage)?)
        .sourced_if(mask.includes(F::ExternalType), "external_type", json!(f.external_type))
        .sourced_if(mask.includes(F::ExternalStage), "external_stage", json!(f.external_stage))
        .sourced_if(mask.includes(F::EstimatedClosedAt), "estimated_closed_at", json!(f.estimated_closed_at))
        .sourced_if(mask.includes(F::Owner), "owner_user_id", json!(f.owner_user_id))
        .sourced_if(mask.includes(F::GeneralNotes), "general_notes", json!(f.general_notes))
        .sourced_if(mask.includes(F::NextSteps), "next_steps", json!(f.next_steps)))
}

impl OpportunityProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>, cascade: Arc<CascadeOrchestrator>) -> Self {
        Self { read_model, cascade }
    }

    pub fn event_types() -> &'static [&'static str] {
        OpportunityEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    fn current(&self, env: &EventEnvelope<OpportunityEvent>) -> Result<Option<OpportunityView>, ProjectionError> {
        Ok(queries::opportunity(self.store(), &env.metadata().tenant, env.entity_id())?.map(|o| o.view))
    }

    fn renewal_created(&self, env: &EventEnvelope<OpportunityEvent>, e: &RenewalCreated) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();

        if let Some(active) = queries::active_renewal(self.store(), tenant, e.contract_id)? {
            if active.id() != id && active.view.renewed_at.is_some_and(|at| at > Utc::now()) {
                debug!(%tenant, contract_id = %e.contract_id, active = %active.id(), "contract already has an active renewal");
                return Ok(());
            }
        }

        let merge = EntityMerge::from_source(labels::OPPORTUNITY, id, &e.source)
            .always("contract_id", json!(e.contract_id))
            .always("internal_type", to_value(&InternalType::Renewal)?)
            .on_create("internal_stage", to_value(&InternalStage::Open)?)
            .sourced("renewal_likelihood", to_value(&e.likelihood)?)
            .sourced("renewal_adjusted_rate", json!(e.adjusted_rate))
            .sourced("renewal_approved", json!(e.approved))
            .sourced("renewed_at", json!(e.renewed_at));
        self.store().merge(tenant, merge)?;

        let contract = NodeRef::new(labels::CONTRACT, e.contract_id);
        let node = NodeRef::new(labels::OPPORTUNITY, id);
        self.store()
            .relate(tenant, Relation::new(contract.clone(), relations::HAS_OPPORTUNITY, node.clone()))?;
        self.store()
            .relate(tenant, Relation::new(contract, relations::ACTIVE_RENEWAL, node))?;

        self.cascade
            .renewal_date_and_arr(&CascadeContext::from_envelope(env), e.contract_id)?;
        Ok(())
    }

    fn renewal_updated(&self, env: &EventEnvelope<OpportunityEvent>, e: &RenewalUpdated) -> Result<(), ProjectionError> {
        use RenewalField as F;
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let u = &e.update;

        let merge = EntityMerge::from_source(labels::OPPORTUNITY, id, &e.source)
            .sourced_if(e.mask.includes(F::Likelihood), "renewal_likelihood", to_value(&u.likelihood)?)
            .sourced_if(e.mask.includes(F::AdjustedRate), "renewal_adjusted_rate", json!(u.adjusted_rate))
            .sourced_if(e.mask.includes(F::Amount), "amount", json!(u.amount))
            .sourced_if(e.mask.includes(F::MaxAmount), "max_amount", json!(u.max_amount))
            .sourced_if(e.mask.includes(F::Comments), "renewal_comments", json!(u.comments))
            .sourced_if(e.mask.includes(F::Approved), "renewal_approved", json!(u.approved))
            .sourced_if(e.mask.includes(F::Owner), "owner_user_id", json!(u.owner_user_id))
            .sourced_if(e.mask.includes(F::RenewedAt), "renewed_at", json!(u.renewed_at));
        let outcome = self.store().merge(tenant, merge)?;

        let likelihood_changed = outcome.changed("renewal_likelihood");
        let rate_changed = outcome.changed("renewal_adjusted_rate");
        let amount_changed = outcome.any_changed(&["amount", "max_amount"]);

        // Attribution only for user edits that moved the figures.
        if let Some(user) = &e.updated_by {
            if likelihood_changed || rate_changed || amount_changed {
                self.store().merge(
                    tenant,
                    EntityMerge::new(labels::OPPORTUNITY, id)
                        .always("renewal_updated_by", json!(user))
                        .always("renewal_updated_at", json!(env.metadata().created_at)),
                )?;
            }
        }

        let Some(renewal) = self.current(env)? else {
            return Ok(());
        };
        let ctx = CascadeContext::from_envelope(env);
        let organization_id = queries::organization_of_opportunity(self.store(), tenant, &renewal)?;

        if likelihood_changed {
            if let Some(org) = organization_id {
                self.cascade.refresh_renewal_summary(&ctx, org);
            }
        }
        if (likelihood_changed || rate_changed) && !amount_changed {
            if let Some(contract_id) = renewal.contract_id {
                self.cascade.renewal_arr(&ctx, contract_id)?;
            }
        } else if amount_changed {
            if let Some(org) = organization_id {
                self.cascade.refresh_arr(&ctx, org);
            }
        }

        if likelihood_changed {
            if let (Some(contract_id), Some(likelihood)) = (renewal.contract_id, renewal.renewal_likelihood) {
                self.cascade.record_likelihood_action(
                    &ctx,
                    contract_id,
                    likelihood,
                    &renewal.renewal_comments,
                    e.updated_by.as_ref(),
                )?;
            }
        }
        Ok(())
    }

    fn closed(
        &self,
        env: &EventEnvelope<OpportunityEvent>,
        stage: InternalStage,
        closed_at: chrono::DateTime<Utc>,
    ) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();

        self.store().merge(
            tenant,
            EntityMerge::new(labels::OPPORTUNITY, id)
                .always("internal_stage", to_value(&stage)?)
                .always("closed_at", json!(closed_at)),
        )?;
        let Some(opportunity) = self.current(env)? else {
            return Ok(());
        };
        let ctx = CascadeContext::from_envelope(env);
        let organization_id = queries::organization_of_opportunity(self.store(), tenant, &opportunity)?;

        match opportunity.internal_type {
            InternalType::Renewal => {
                if let Some(contract_id) = opportunity.contract_id {
                    self.store().unrelate(
                        tenant,
                        &NodeRef::new(labels::CONTRACT, contract_id),
                        relations::ACTIVE_RENEWAL,
                        &NodeRef::new(labels::OPPORTUNITY, id),
                    )?;
                    if stage == InternalStage::ClosedWon {
                        self.next_renewal(&ctx, contract_id)?;
                    }
                }
                if let Some(org) = organization_id {
                    self.cascade.refresh_renewal_summary(&ctx, org);
                    self.cascade.refresh_arr(&ctx, org);
                }
            }
            InternalType::NewBusiness => {
                if !opportunity.external_stage.is_empty() {
                    self.cascade.clear_external_stage(&ctx, id);
                }
                if let Some(org) = organization_id {
                    match stage {
                        InternalStage::ClosedWon => {
                            self.cascade.mark_customer(&ctx, org)?;
                        }
                        _ => {
                            self.cascade.retarget_engaged_prospect(&ctx, org)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// A won renewal rolls the contract over into its next cycle.
    fn next_renewal(&self, ctx: &CascadeContext, contract_id: custos_core::EntityId) -> Result<(), ProjectionError> {
        let Some(contract) = queries::contract(self.store(), &ctx.tenant, contract_id)? else {
            return Ok(());
        };
        let ended = contract.view.ended_at.is_some_and(|at| at < ctx.now);
        if contract.view.renews() && !ended {
            self.cascade.create_renewal(ctx, contract_id);
        }
        Ok(())
    }
}

impl EventHandler for OpportunityProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<OpportunityEvent>(event)? else {
            return Ok(());
        };
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::OPPORTUNITY, id);

        match env.payload() {
            OpportunityEvent::Created(e) => {
                let merge = EntityMerge::from_source(labels::OPPORTUNITY, id, &e.source)
                    .always("organization_id", json!(e.organization_id))
                    .sourced("internal_type", to_value(&e.fields.internal_type)?)
                    .on_create("created_by", json!(e.created_by));
                self.store()
                    .merge(tenant, opportunity_fields(merge, &e.fields, &FieldMask::all())?)?;
                if let Some(org) = e.organization_id {
                    self.store().relate(
                        tenant,
                        Relation::new(NodeRef::new(labels::ORGANIZATION, org), relations::HAS_OPPORTUNITY, node.clone()),
                    )?;
                }
                link_external(self.store(), tenant, &node, &e.external_system)?;
            }
            OpportunityEvent::Updated(e) => {
                let merge = EntityMerge::from_source(labels::OPPORTUNITY, id, &e.source);
                let outcome = self.store().merge(tenant, opportunity_fields(merge, &e.fields, &e.mask)?)?;
                if outcome.any_changed(&["internal_stage", "external_stage"]) {
                    self.store().merge(
                        tenant,
                        EntityMerge::new(labels::OPPORTUNITY, id)
                            .always("stage_updated_at", json!(env.metadata().created_at)),
                    )?;
                }
                link_external(self.store(), tenant, &node, &e.external_system)?;

                if outcome.any_changed(&["amount", "max_amount"]) {
                    if let Some(opportunity) = self.current(&env)? {
                        if opportunity.internal_type == InternalType::Renewal {
                            if let Some(org) = queries::organization_of_opportunity(self.store(), tenant, &opportunity)? {
                                self.cascade.refresh_arr(&CascadeContext::from_envelope(&env), org);
                            }
                        }
                    }
                }
            }
            OpportunityEvent::RenewalCreated(e) => self.renewal_created(&env, e)?,
            OpportunityEvent::RenewalUpdated(e) => self.renewal_updated(&env, e)?,
            OpportunityEvent::NextCycleDateUpdated(e) => {
                self.store().merge(
                    tenant,
                    EntityMerge::new(labels::OPPORTUNITY, id).always("renewed_at", json!(e.renewed_at)),
                )?;
                let Some(renewal) = self.current(&env)? else {
                    return Ok(());
                };
                let ctx = CascadeContext::from_envelope(&env);
                if let Some(contract_id) = renewal.contract_id {
                    self.cascade.renewal_likelihood(&ctx, contract_id)?;
                    self.cascade.request_contract_status_refresh(&ctx, contract_id);
                }
                if let Some(org) = queries::organization_of_opportunity(self.store(), tenant, &renewal)? {
                    self.cascade.refresh_renewal_summary(&ctx, org);
                }
            }
            OpportunityEvent::ClosedWon(e) => self.closed(&env, InternalStage::ClosedWon, e.closed_at)?,
            OpportunityEvent::ClosedLost(e) => self.closed(&env, InternalStage::ClosedLost, e.closed_at)?,
        }
        Ok(())
    }
}
