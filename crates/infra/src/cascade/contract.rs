//! Contract-driven follow-ups: status, organization relationship, onboarding and the
//! upkeep of the contract's open renewal opportunity.

use serde_json::json;
use tracing::debug;

use custos_contract::{ContractStatus, StatusInputs, derive_status};
use custos_core::{EntityId, ExternalSystem, FieldMask};
use custos_opportunity::{
    CloseLostOpportunity, CreateRenewalOpportunity, InternalStage, InternalType, OpportunityCommand,
    RenewalField, RenewalUpdate, UpdateRenewalNextCycleDate, UpdateRenewalOpportunity,
};
use custos_organization::{
    OnboardingStatus, OrganizationCommand, OrganizationField, OrganizationFields, Relationship, Stage,
    UpdateOnboardingStatus, UpdateOrganization,
};

use crate::read_model::{
    ActionEntry, ContractView, EntityMerge, Loaded, NodeRef, OpportunityView, OrganizationView, ReadModelError,
    ReadModelStore, ServiceLineItemView, labels, queries, relations,
};

use super::renewal;
use super::{CascadeContext, CascadeOrchestrator, OutboundCommand};

pub const CONTRACT_STATUS_ACTION: &str = "CONTRACT_STATUS_UPDATED";
const UNNAMED_CONTRACT: &str = "Unnamed contract";

pub fn status_inputs(contract: &ContractView, active_renewal: Option<&OpportunityView>) -> StatusInputs {
    StatusInputs {
        approved: contract.approved,
        auto_renew: contract.auto_renew,
        service_started_at: contract.service_started_at,
        ended_at: contract.ended_at,
        active_renewal_renewed_at: active_renewal.and_then(|r| r.renewed_at),
    }
}

fn is_ended(contract: &ContractView, now: chrono::DateTime<chrono::Utc>) -> bool {
    contract.ended_at.is_some_and(|ended| ended < now)
}

fn same_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005
}

/// Outcome of re-deriving one contract's status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub contract_id: EntityId,
    pub organization_id: Option<EntityId>,
    pub name: String,
    pub previous: ContractStatus,
    pub current: ContractStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    fn display_name(&self) -> &str {
        if self.name.trim().is_empty() { UNNAMED_CONTRACT } else { &self.name }
    }
}

impl CascadeOrchestrator {
    /// Re-derive a contract's status from its fields and open renewal, storing it when
    /// it moved. `None` when the contract is not in the read model.
    pub fn refresh_contract_status(
        &self,
        ctx: &CascadeContext,
        contract_id: EntityId,
    ) -> Result<Option<StatusChange>, ReadModelError> {
        let Some(contract) = queries::contract(self.read_model(), &ctx.tenant, contract_id)? else {
            return Ok(None);
        };
        let active = queries::active_renewal(self.read_model(), &ctx.tenant, contract_id)?;
        let inputs = status_inputs(&contract.view, active.as_ref().map(|r| &r.view));
        let current = derive_status(&inputs, ctx.now);

        let change = StatusChange {
            contract_id,
            organization_id: contract.view.organization_id,
            name: contract.view.name.clone(),
            previous: contract.view.status,
            current,
        };
        if change.changed() {
            self.read_model().merge(
                &ctx.tenant,
                EntityMerge::new(labels::CONTRACT, contract_id).always("status", json!(current)),
            )?;
            debug!(tenant = %ctx.tenant, %contract_id, previous = ?change.previous, ?current, "contract status changed");
        }
        Ok(Some(change))
    }

    /// Timeline entry for a status transition worth announcing.
    pub fn record_status_action(
        &self,
        ctx: &CascadeContext,
        change: &StatusChange,
        app_source: &str,
    ) -> Result<bool, ReadModelError> {
        if !change.changed() {
            return Ok(false);
        }
        let Some(content) = change.current.change_message(&change.name) else {
            return Ok(false);
        };
        let action = ActionEntry {
            id: ctx.causation_id,
            entity: NodeRef::new(labels::CONTRACT, change.contract_id),
            action_type: CONTRACT_STATUS_ACTION.to_string(),
            metadata: json!({
                "status": change.current,
                "contract_name": change.display_name(),
                "comment": content,
            }),
            content,
            app_source: app_source.to_string(),
            created_at: ctx.now,
        };
        self.read_model().append_action(&ctx.tenant, action)
    }

    /// An ended contract with no other active contract turns its organization into a
    /// former customer.
    pub fn update_relationship_if_churned(
        &self,
        ctx: &CascadeContext,
        change: &StatusChange,
    ) -> Result<bool, ReadModelError> {
        if !change.changed() || change.current != ContractStatus::Ended {
            return Ok(false);
        }
        let Some(organization_id) = change.organization_id else {
            return Ok(false);
        };
        let still_active = queries::contracts_of(self.read_model(), &ctx.tenant, organization_id)?
            .iter()
            .any(|c| c.id() != change.contract_id && c.view.status.is_active());
        if still_active {
            return Ok(false);
        }

        Ok(self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::Update(UpdateOrganization {
                base: ctx.base(organization_id),
                fields: OrganizationFields {
                    relationship: Some(Relationship::FormerCustomer),
                    stage: Some(Stage::Target),
                    ..Default::default()
                },
                mask: FieldMask::only([OrganizationField::Relationship, OrganizationField::Stage]),
                source: ctx.source(),
                external_system: ExternalSystem::default(),
            })),
        ))
    }

    /// A contract going live starts onboarding for organizations that had none.
    pub fn recompute_onboarding(&self, ctx: &CascadeContext, change: &StatusChange) -> Result<bool, ReadModelError> {
        if !change.changed() || change.current != ContractStatus::Live {
            return Ok(false);
        }
        let Some(organization_id) = change.organization_id else {
            return Ok(false);
        };
        let status = queries::load::<OrganizationView>(
            self.read_model(),
            &ctx.tenant,
            labels::ORGANIZATION,
            organization_id,
        )?
        .map(|org| org.view.onboarding_status)
        .unwrap_or_default();
        if status != OnboardingStatus::NotApplicable {
            return Ok(false);
        }

        Ok(self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::UpdateOnboardingStatus(UpdateOnboardingStatus {
                base: ctx.base(organization_id),
                status: OnboardingStatus::NotStarted,
                comments: String::new(),
                caused_by_contract_id: Some(change.contract_id),
            })),
        ))
    }

    /// Open a renewal opportunity for the contract. The id is derived from the
    /// triggering event, so a redelivery lands on the same aggregate.
    pub fn create_renewal(&self, ctx: &CascadeContext, contract_id: EntityId) -> bool {
        let id = ctx.derived_id(&format!("renewal:{contract_id}"));
        self.send(
            ctx,
            OutboundCommand::Opportunity(OpportunityCommand::CreateRenewal(CreateRenewalOpportunity {
                base: ctx.base(id),
                contract_id,
                likelihood: None,
                adjusted_rate: 0,
                approved: false,
                renewed_at: None,
                source: ctx.source(),
            })),
        )
    }

    /// The contract lost its renewal cycle: suspend the open renewal, detach it, then
    /// refresh the organization's summary and ARR once each.
    pub fn suspend_renewal(
        &self,
        ctx: &CascadeContext,
        contract_id: EntityId,
        organization_id: Option<EntityId>,
    ) -> Result<bool, ReadModelError> {
        let Some(renewal) = queries::active_renewal(self.read_model(), &ctx.tenant, contract_id)? else {
            return Ok(false);
        };
        self.read_model().merge(
            &ctx.tenant,
            EntityMerge::new(labels::OPPORTUNITY, renewal.id()).always("internal_stage", json!(InternalStage::Suspended)),
        )?;
        self.read_model().unrelate(
            &ctx.tenant,
            &NodeRef::new(labels::CONTRACT, contract_id),
            relations::ACTIVE_RENEWAL,
            &renewal.record.node(),
        )?;
        debug!(tenant = %ctx.tenant, %contract_id, renewal = %renewal.id(), "renewal suspended");

        if let Some(org) = organization_id {
            self.refresh_renewal_summary(ctx, org);
            self.refresh_arr(ctx, org);
        }
        Ok(true)
    }

    /// Recompute the open renewal's next cycle date and ARR, opening a renewal when a
    /// renewing contract has none.
    pub fn renewal_date_and_arr(&self, ctx: &CascadeContext, contract_id: EntityId) -> Result<(), ReadModelError> {
        let Some((contract, renewal)) = self.contract_and_renewal(ctx, contract_id)? else {
            return Ok(());
        };
        self.update_next_cycle_date(ctx, &contract, &renewal)?;
        self.update_renewal_arr(ctx, &contract, &renewal)?;
        Ok(())
    }

    /// Recompute only the open renewal's ARR.
    pub fn renewal_arr(&self, ctx: &CascadeContext, contract_id: EntityId) -> Result<bool, ReadModelError> {
        match self.contract_and_renewal(ctx, contract_id)? {
            Some((contract, renewal)) => self.update_renewal_arr(ctx, &contract, &renewal),
            None => Ok(false),
        }
    }

    /// Align the open renewal's likelihood with the contract end date.
    pub fn renewal_likelihood(&self, ctx: &CascadeContext, contract_id: EntityId) -> Result<bool, ReadModelError> {
        let Some(contract) = queries::contract(self.read_model(), &ctx.tenant, contract_id)? else {
            return Ok(false);
        };
        let Some(renewal) = queries::active_renewal(self.read_model(), &ctx.tenant, contract_id)? else {
            return Ok(false);
        };
        let Some((likelihood, rate)) = renewal::recomputed_likelihood(
            renewal.view.renewal_likelihood,
            renewal.view.renewed_at,
            contract.view.ended_at,
        ) else {
            return Ok(false);
        };

        Ok(self.send(
            ctx,
            OutboundCommand::Opportunity(OpportunityCommand::UpdateRenewal(UpdateRenewalOpportunity {
                base: ctx.base(renewal.id()),
                update: RenewalUpdate {
                    likelihood: Some(likelihood),
                    adjusted_rate: rate,
                    ..Default::default()
                },
                mask: FieldMask::only([RenewalField::Likelihood, RenewalField::AdjustedRate]),
                source: ctx.source(),
            })),
        ))
    }

    fn contract_and_renewal(
        &self,
        ctx: &CascadeContext,
        contract_id: EntityId,
    ) -> Result<Option<(Loaded<ContractView>, Loaded<OpportunityView>)>, ReadModelError> {
        let Some(contract) = queries::contract(self.read_model(), &ctx.tenant, contract_id)? else {
            return Ok(None);
        };
        if !contract.view.renews() {
            return Ok(None);
        }
        match queries::active_renewal(self.read_model(), &ctx.tenant, contract_id)? {
            Some(renewal) => Ok(Some((contract, renewal))),
            None => {
                if !is_ended(&contract.view, ctx.now) {
                    self.create_renewal(ctx, contract_id);
                }
                Ok(None)
            }
        }
    }

    fn update_next_cycle_date(
        &self,
        ctx: &CascadeContext,
        contract: &Loaded<ContractView>,
        renewal: &Loaded<OpportunityView>,
    ) -> Result<bool, ReadModelError> {
        if is_ended(&contract.view, ctx.now) {
            return Ok(self.send(
                ctx,
                OutboundCommand::Opportunity(OpportunityCommand::CloseLost(CloseLostOpportunity {
                    base: ctx.base(renewal.id()),
                    closed_at: Some(ctx.now),
                })),
            ));
        }

        let anchor = self.renewal_anchor(ctx, contract)?;
        let next = renewal::next_cycle_date(anchor, contract.view.length_in_months, contract.view.auto_renew, ctx.now);
        if next == renewal.view.renewed_at {
            return Ok(false);
        }
        Ok(self.send(
            ctx,
            OutboundCommand::Opportunity(OpportunityCommand::UpdateNextCycleDate(UpdateRenewalNextCycleDate {
                base: ctx.base(renewal.id()),
                renewed_at: next,
            })),
        ))
    }

    /// Cycles run from the last won renewal, or from the service start.
    fn renewal_anchor(
        &self,
        ctx: &CascadeContext,
        contract: &Loaded<ContractView>,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, ReadModelError> {
        let last_won = queries::opportunities_of_contract(self.read_model(), &ctx.tenant, contract.id())?
            .into_iter()
            .filter(|o| o.view.internal_type == InternalType::Renewal && o.view.internal_stage == InternalStage::ClosedWon)
            .filter_map(|o| o.view.renewed_at)
            .max();
        Ok(last_won.or(contract.view.service_started_at))
    }

    fn update_renewal_arr(
        &self,
        ctx: &CascadeContext,
        contract: &Loaded<ContractView>,
        renewal: &Loaded<OpportunityView>,
    ) -> Result<bool, ReadModelError> {
        if is_ended(&contract.view, ctx.now) {
            return Ok(false);
        }
        let items: Vec<ServiceLineItemView> = queries::service_line_items_of(self.read_model(), &ctx.tenant, contract.id())?
            .into_iter()
            .map(|item| item.view)
            .collect();
        let max = renewal::max_arr(&items, contract.view.ended_at, ctx.now);
        let current = renewal::current_arr(max, renewal.view.renewal_adjusted_rate);
        if same_amount(current, renewal.view.amount) && same_amount(max, renewal.view.max_amount) {
            return Ok(false);
        }

        Ok(self.send(
            ctx,
            OutboundCommand::Opportunity(OpportunityCommand::UpdateRenewal(UpdateRenewalOpportunity {
                base: ctx.base(renewal.id()),
                update: RenewalUpdate {
                    amount: current,
                    max_amount: max,
                    ..Default::default()
                },
                mask: FieldMask::only([RenewalField::Amount, RenewalField::MaxAmount]),
                source: ctx.source(),
            })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use custos_core::TenantId;

    use super::*;
    use crate::cascade::gateway::RecordingGateway;
    use crate::read_model::{InMemoryReadModel, Relation};
    use custos_opportunity::RenewalLikelihood;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ctx() -> CascadeContext {
        CascadeContext {
            tenant: TenantId::new("acme"),
            causation_id: Uuid::now_v7(),
            now: now(),
        }
    }

    struct Fixture {
        store: Arc<InMemoryReadModel>,
        gateway: Arc<RecordingGateway>,
        orchestrator: CascadeOrchestrator,
        org: EntityId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryReadModel::new());
        let gateway = Arc::new(RecordingGateway::new());
        let orchestrator = CascadeOrchestrator::new(store.clone(), gateway.clone());
        Fixture {
            store,
            gateway,
            orchestrator,
            org: EntityId::new(),
        }
    }

    impl Fixture {
        fn contract(&self, build: impl FnOnce(EntityMerge) -> EntityMerge) -> EntityId {
            let id = EntityId::new();
            let merge = EntityMerge::new(labels::CONTRACT, id)
                .always("organization_id", json!(self.org))
                .always("name", json!("Pro plan"));
            self.store.merge(&ctx().tenant, build(merge)).unwrap();
            self.store
                .relate(
                    &ctx().tenant,
                    Relation::new(
                        NodeRef::new(labels::ORGANIZATION, self.org),
                        relations::HAS_CONTRACT,
                        NodeRef::new(labels::CONTRACT, id),
                    ),
                )
                .unwrap();
            id
        }

        fn renewal(&self, contract_id: EntityId, build: impl FnOnce(EntityMerge) -> EntityMerge) -> EntityId {
            let id = EntityId::new();
            let merge = EntityMerge::new(labels::OPPORTUNITY, id)
                .always("internal_type", json!("RENEWAL"))
                .always("internal_stage", json!("OPEN"))
                .always("contract_id", json!(contract_id))
                .always("renewal_likelihood", json!("HIGH"))
                .always("renewal_adjusted_rate", json!(100));
            self.store.merge(&ctx().tenant, build(merge)).unwrap();
            let contract = NodeRef::new(labels::CONTRACT, contract_id);
            let opp = NodeRef::new(labels::OPPORTUNITY, id);
            for kind in [relations::HAS_OPPORTUNITY, relations::ACTIVE_RENEWAL] {
                self.store
                    .relate(&ctx().tenant, Relation::new(contract.clone(), kind, opp.clone()))
                    .unwrap();
            }
            id
        }

        fn line_item(&self, contract_id: EntityId, billed: &str, price: f64) {
            let id = EntityId::new();
            self.store
                .merge(
                    &ctx().tenant,
                    EntityMerge::new(labels::SERVICE_LINE_ITEM, id)
                        .always("billed", json!(billed))
                        .always("price", json!(price))
                        .always("quantity", json!(1)),
                )
                .unwrap();
            self.store
                .relate(
                    &ctx().tenant,
                    Relation::new(
                        NodeRef::new(labels::CONTRACT, contract_id),
                        relations::HAS_SERVICE,
                        NodeRef::new(labels::SERVICE_LINE_ITEM, id),
                    ),
                )
                .unwrap();
        }
    }

    fn live(merge: EntityMerge) -> EntityMerge {
        merge
            .always("approved", json!(true))
            .always("auto_renew", json!(true))
            .always("length_in_months", json!(12))
            .always("service_started_at", json!(now() - Duration::days(30)))
    }

    #[test]
    fn status_is_derived_and_stored_once() {
        let f = fixture();
        let contract = f.contract(live);
        let ctx = ctx();

        let change = f.orchestrator.refresh_contract_status(&ctx, contract).unwrap().unwrap();
        assert_eq!(change.previous, ContractStatus::Draft);
        assert_eq!(change.current, ContractStatus::Live);
        assert!(f.orchestrator.record_status_action(&ctx, &change, "web").unwrap());
        // Redelivery of the same event adds nothing.
        assert!(!f.orchestrator.record_status_action(&ctx, &change, "web").unwrap());

        let again = f.orchestrator.refresh_contract_status(&ctx, contract).unwrap().unwrap();
        assert!(!again.changed());

        let actions = f
            .store
            .actions_for(&ctx.tenant, &NodeRef::new(labels::CONTRACT, contract))
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].content, "Pro plan is now live");
        assert_eq!(actions[0].metadata["status"], json!("LIVE"));
    }

    #[test]
    fn last_ended_contract_makes_the_organization_a_former_customer() {
        let f = fixture();
        let ended = f.contract(|m| live(m).always("ended_at", json!(now() - Duration::days(1))));
        let ctx = ctx();
        let change = f.orchestrator.refresh_contract_status(&ctx, ended).unwrap().unwrap();
        assert_eq!(change.current, ContractStatus::Ended);

        assert!(f.orchestrator.update_relationship_if_churned(&ctx, &change).unwrap());
        let sent = f.gateway.sent();
        let OutboundCommand::Organization(OrganizationCommand::Update(update)) = &sent[0] else {
            panic!("expected an organization update, got {sent:?}");
        };
        assert_eq!(update.fields.relationship, Some(Relationship::FormerCustomer));
        assert_eq!(update.fields.stage, Some(Stage::Target));
        assert!(!update.mask.includes(OrganizationField::Name));
    }

    #[test]
    fn another_active_contract_keeps_the_customer() {
        let f = fixture();
        f.contract(|m| live(m).always("status", json!("LIVE")));
        let ended = f.contract(|m| live(m).always("ended_at", json!(now() - Duration::days(1))));
        let ctx = ctx();
        let change = f.orchestrator.refresh_contract_status(&ctx, ended).unwrap().unwrap();

        assert!(!f.orchestrator.update_relationship_if_churned(&ctx, &change).unwrap());
        assert!(f.gateway.sent().is_empty());
    }

    #[test]
    fn going_live_starts_onboarding_only_when_not_applicable() {
        let f = fixture();
        let contract = f.contract(live);
        let ctx = ctx();
        let change = f.orchestrator.refresh_contract_status(&ctx, contract).unwrap().unwrap();

        assert!(f.orchestrator.recompute_onboarding(&ctx, &change).unwrap());
        assert_eq!(f.gateway.count("organization.update_onboarding_status"), 1);

        f.store
            .merge(
                &ctx.tenant,
                EntityMerge::new(labels::ORGANIZATION, f.org).always("onboarding_status", json!("ON_TRACK")),
            )
            .unwrap();
        assert!(!f.orchestrator.recompute_onboarding(&ctx, &change).unwrap());
    }

    #[test]
    fn suspension_refreshes_the_organization_exactly_once() {
        let f = fixture();
        let contract = f.contract(live);
        let renewal = f.renewal(contract, |m| m);
        let ctx = ctx();

        assert!(f.orchestrator.suspend_renewal(&ctx, contract, Some(f.org)).unwrap());
        // A redelivery finds no open renewal and sends nothing more.
        assert!(!f.orchestrator.suspend_renewal(&ctx, contract, Some(f.org)).unwrap());

        assert_eq!(f.gateway.count("organization.refresh_arr"), 1);
        assert_eq!(f.gateway.count("organization.refresh_renewal_summary"), 1);
        let opp = queries::opportunity(f.store.as_ref(), &ctx.tenant, renewal).unwrap().unwrap();
        assert_eq!(opp.view.internal_stage, InternalStage::Suspended);
        assert!(queries::active_renewal(f.store.as_ref(), &ctx.tenant, contract).unwrap().is_none());
    }

    #[test]
    fn missing_renewal_is_created_with_a_stable_id() {
        let f = fixture();
        let contract = f.contract(live);
        let ctx = ctx();

        f.orchestrator.renewal_date_and_arr(&ctx, contract).unwrap();
        f.orchestrator.renewal_date_and_arr(&ctx, contract).unwrap();

        let ids: Vec<EntityId> = f
            .gateway
            .sent()
            .iter()
            .filter_map(|c| match c {
                OutboundCommand::Opportunity(OpportunityCommand::CreateRenewal(c)) => Some(c.base.entity_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn renewal_gets_next_date_and_arr() {
        let f = fixture();
        let contract = f.contract(live);
        f.renewal(contract, |m| m);
        f.line_item(contract, "MONTHLY", 100.0);
        let ctx = ctx();

        f.orchestrator.renewal_date_and_arr(&ctx, contract).unwrap();

        let sent = f.gateway.sent();
        assert_eq!(sent.len(), 2);
        let OutboundCommand::Opportunity(OpportunityCommand::UpdateNextCycleDate(next)) = &sent[0] else {
            panic!("expected a next cycle date update, got {sent:?}");
        };
        assert_eq!(next.renewed_at, Some(now() - Duration::days(30) + chrono::Months::new(12)));
        let OutboundCommand::Opportunity(OpportunityCommand::UpdateRenewal(arr)) = &sent[1] else {
            panic!("expected a renewal update, got {sent:?}");
        };
        assert_eq!(arr.update.max_amount, 1200.0);
        assert_eq!(arr.update.amount, 1200.0);
        assert!(arr.mask.includes(RenewalField::Amount));
        assert!(!arr.mask.includes(RenewalField::Likelihood));
    }

    #[test]
    fn ended_contract_closes_its_renewal_as_lost() {
        let f = fixture();
        let contract = f.contract(|m| live(m).always("ended_at", json!(now() - Duration::days(2))));
        f.renewal(contract, |m| m);

        f.orchestrator.renewal_date_and_arr(&ctx(), contract).unwrap();
        assert_eq!(f.gateway.names(), vec!["opportunity.close_lost"]);
    }

    #[test]
    fn likelihood_follows_the_end_date() {
        let f = fixture();
        let contract = f.contract(|m| live(m).always("ended_at", json!(now() + Duration::days(30))));
        f.renewal(contract, |m| m.always("renewed_at", json!(now() + Duration::days(90))));

        assert!(f.orchestrator.renewal_likelihood(&ctx(), contract).unwrap());
        let sent = f.gateway.sent();
        let OutboundCommand::Opportunity(OpportunityCommand::UpdateRenewal(update)) = &sent[0] else {
            panic!("expected a renewal update, got {sent:?}");
        };
        assert_eq!(update.update.likelihood, Some(RenewalLikelihood::Zero));
        assert_eq!(update.update.adjusted_rate, 0);
    }
}
