//! Opportunity-driven follow-ups: closing new business and announcing renewal
//! likelihood changes.

use serde_json::json;

use custos_contract::{ContractCommand, RefreshContractStatus};
use custos_core::{APP_SOURCE_SUBSCRIBERS, EntityId, ExternalSystem, FieldMask, UserId};
use custos_opportunity::{OpportunityCommand, OpportunityField, OpportunityFields, RenewalLikelihood, UpdateOpportunity};
use custos_organization::{
    OrganizationCommand, OrganizationField, OrganizationFields, Relationship, Stage, UpdateOrganization,
};

use crate::read_model::{ActionEntry, NodeRef, OrganizationView, ReadModelError, labels, queries};

use super::{CascadeContext, CascadeOrchestrator, OutboundCommand};

pub const LIKELIHOOD_ACTION: &str = "RENEWAL_LIKELIHOOD_UPDATED";

fn title_case(likelihood: RenewalLikelihood) -> String {
    let raw = likelihood.as_str();
    let mut out = raw[..1].to_string();
    out.push_str(&raw[1..].to_lowercase());
    out
}

/// `"Renewal likelihood set to Medium by <user>"`.
pub fn likelihood_message(likelihood: RenewalLikelihood, updated_by: Option<&UserId>) -> String {
    match updated_by {
        Some(user) => format!("Renewal likelihood set to {} by {user}", title_case(likelihood)),
        None => format!("Renewal likelihood set to {}", title_case(likelihood)),
    }
}

impl CascadeOrchestrator {
    /// A won new-business opportunity makes its organization a customer, unless it
    /// already is one or is still trialling.
    pub fn mark_customer(&self, ctx: &CascadeContext, organization_id: EntityId) -> Result<bool, ReadModelError> {
        let org = queries::load::<OrganizationView>(self.read_model(), &ctx.tenant, labels::ORGANIZATION, organization_id)?;
        if let Some(org) = org {
            if org.view.relationship == Some(Relationship::Customer) || org.view.stage == Some(Stage::Trial) {
                return Ok(false);
            }
        }

        Ok(self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::Update(UpdateOrganization {
                base: ctx.base(organization_id),
                fields: OrganizationFields {
                    relationship: Some(Relationship::Customer),
                    stage: Some(Stage::InitialValue),
                    ..Default::default()
                },
                mask: FieldMask::only([OrganizationField::Relationship, OrganizationField::Stage]),
                source: ctx.source(),
                external_system: ExternalSystem::default(),
            })),
        ))
    }

    /// A lost new-business deal sends an engaged prospect back to target.
    pub fn retarget_engaged_prospect(&self, ctx: &CascadeContext, organization_id: EntityId) -> Result<bool, ReadModelError> {
        let Some(org) =
            queries::load::<OrganizationView>(self.read_model(), &ctx.tenant, labels::ORGANIZATION, organization_id)?
        else {
            return Ok(false);
        };
        if org.view.relationship != Some(Relationship::Prospect) || org.view.stage != Some(Stage::Engaged) {
            return Ok(false);
        }

        Ok(self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::Update(UpdateOrganization {
                base: ctx.base(organization_id),
                fields: OrganizationFields {
                    stage: Some(Stage::Target),
                    ..Default::default()
                },
                mask: FieldMask::only([OrganizationField::Stage]),
                source: ctx.source(),
                external_system: ExternalSystem::default(),
            })),
        ))
    }

    /// Closed opportunities carry no external pipeline stage.
    pub fn clear_external_stage(&self, ctx: &CascadeContext, opportunity_id: EntityId) -> bool {
        self.send(
            ctx,
            OutboundCommand::Opportunity(OpportunityCommand::Update(UpdateOpportunity {
                base: ctx.base(opportunity_id),
                fields: OpportunityFields::default(),
                mask: FieldMask::only([OpportunityField::ExternalStage]),
                source: ctx.source(),
                external_system: ExternalSystem::default(),
            })),
        )
    }

    pub fn request_contract_status_refresh(&self, ctx: &CascadeContext, contract_id: EntityId) -> bool {
        self.send(
            ctx,
            OutboundCommand::Contract(ContractCommand::RefreshStatus(RefreshContractStatus {
                base: ctx.base(contract_id),
            })),
        )
    }

    /// Timeline entry on the contract when its renewal likelihood moved.
    pub fn record_likelihood_action(
        &self,
        ctx: &CascadeContext,
        contract_id: EntityId,
        likelihood: RenewalLikelihood,
        comments: &str,
        updated_by: Option<&UserId>,
    ) -> Result<bool, ReadModelError> {
        let action = ActionEntry {
            id: ctx.causation_id,
            entity: NodeRef::new(labels::CONTRACT, contract_id),
            action_type: LIKELIHOOD_ACTION.to_string(),
            content: likelihood_message(likelihood, updated_by),
            metadata: json!({ "likelihood": likelihood, "reason": comments }),
            app_source: APP_SOURCE_SUBSCRIBERS.to_string(),
            created_at: ctx.now,
        };
        self.read_model().append_action(&ctx.tenant, action)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use custos_core::TenantId;

    use super::*;
    use crate::cascade::gateway::RecordingGateway;
    use crate::read_model::{EntityMerge, InMemoryReadModel, ReadModelStore};

    fn ctx() -> CascadeContext {
        CascadeContext {
            tenant: TenantId::new("acme"),
            causation_id: Uuid::now_v7(),
            now: chrono::Utc::now(),
        }
    }

    fn fixture() -> (Arc<InMemoryReadModel>, Arc<RecordingGateway>, CascadeOrchestrator) {
        let store = Arc::new(InMemoryReadModel::new());
        let gateway = Arc::new(RecordingGateway::new());
        let orchestrator = CascadeOrchestrator::new(store.clone(), gateway.clone());
        (store, gateway, orchestrator)
    }

    #[test]
    fn likelihood_message_names_the_user_when_known() {
        let user = UserId::new();
        assert_eq!(
            likelihood_message(RenewalLikelihood::Medium, Some(&user)),
            format!("Renewal likelihood set to Medium by {user}")
        );
        assert_eq!(likelihood_message(RenewalLikelihood::Zero, None), "Renewal likelihood set to Zero");
    }

    #[test]
    fn existing_customers_are_left_alone() {
        let (store, gateway, orchestrator) = fixture();
        let org = EntityId::new();
        store
            .merge(
                &TenantId::new("acme"),
                EntityMerge::new(labels::ORGANIZATION, org).always("relationship", json!(Relationship::Customer)),
            )
            .unwrap();

        assert!(!orchestrator.mark_customer(&ctx(), org).unwrap());
        assert!(gateway.sent().is_empty());
    }

    #[test]
    fn prospects_become_customers() {
        let (store, gateway, orchestrator) = fixture();
        let org = EntityId::new();
        store
            .merge(
                &TenantId::new("acme"),
                EntityMerge::new(labels::ORGANIZATION, org).always("relationship", json!(Relationship::Prospect)),
            )
            .unwrap();

        assert!(orchestrator.mark_customer(&ctx(), org).unwrap());
        assert_eq!(gateway.names(), vec!["organization.update"]);
    }

    #[test]
    fn only_engaged_prospects_are_retargeted() {
        let (store, gateway, orchestrator) = fixture();
        let engaged = EntityId::new();
        let lead = EntityId::new();
        for (id, stage) in [(engaged, Stage::Engaged), (lead, Stage::Lead)] {
            store
                .merge(
                    &TenantId::new("acme"),
                    EntityMerge::new(labels::ORGANIZATION, id)
                        .always("relationship", json!(Relationship::Prospect))
                        .always("stage", json!(stage)),
                )
                .unwrap();
        }

        assert!(orchestrator.retarget_engaged_prospect(&ctx(), engaged).unwrap());
        assert!(!orchestrator.retarget_engaged_prospect(&ctx(), lead).unwrap());
        assert_eq!(gateway.count("organization.update"), 1);
    }

    #[test]
    fn likelihood_actions_are_recorded_once_per_event() {
        let (store, _, orchestrator) = fixture();
        let contract = EntityId::new();
        let ctx = ctx();

        assert!(orchestrator
            .record_likelihood_action(&ctx, contract, RenewalLikelihood::Low, "budget cuts", None)
            .unwrap());
        assert!(!orchestrator
            .record_likelihood_action(&ctx, contract, RenewalLikelihood::Low, "budget cuts", None)
            .unwrap());

        let actions = store
            .actions_for(&TenantId::new("acme"), &NodeRef::new(labels::CONTRACT, contract))
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].content, "Renewal likelihood set to Low");
    }
}
