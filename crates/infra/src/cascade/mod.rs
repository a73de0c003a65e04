//! Cascade orchestrator: derived recomputation across aggregates.
//!
//! A projector that notices a meaningful change (amount, likelihood, renewal cycle,
//! contract status) asks the orchestrator to follow up. Follow-ups are either:
//!
//! - commands sent synchronously to sibling aggregates through a [`CommandGateway`],
//!   tagged with the triggering event id as causation, or
//! - derived figures computed from the read model ([`renewal`]).
//!
//! A failed follow-up command never fails the projection that triggered it: it is logged at
//! `warn` and healed by the next relevant event. Refresh events (`arr_refreshed`,
//! `renewal_summary_refreshed`) only recompute and never cascade, which caps the
//! organization ↔ opportunity cycle at one hop.

pub mod contract;
pub mod gateway;
pub mod opportunity;
pub mod renewal;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use custos_contract::ContractCommand;
use custos_core::{APP_SOURCE_SUBSCRIBERS, EntityId, SourceFields, TenantId};
use custos_events::{BaseCommand, Command, EventEnvelope, RecordedEvent};
use custos_opportunity::OpportunityCommand;
use custos_organization::{OrganizationCommand, RefreshArr, RefreshRenewalSummary};

use crate::command_dispatcher::DispatchError;
use crate::read_model::ReadModelStore;

pub use gateway::DispatchingGateway;

/// A command issued by a cascade, addressed to one aggregate family.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    Organization(OrganizationCommand),
    Contract(ContractCommand),
    Opportunity(OpportunityCommand),
}

impl OutboundCommand {
    pub fn base(&self) -> &BaseCommand {
        match self {
            OutboundCommand::Organization(c) => c.base(),
            OutboundCommand::Contract(c) => c.base(),
            OutboundCommand::Opportunity(c) => c.base(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::Organization(c) => match c {
                OrganizationCommand::Create(_) => "organization.create",
                OrganizationCommand::Update(_) => "organization.update",
                OrganizationCommand::AddParent(_) => "organization.add_parent",
                OrganizationCommand::RemoveParent(_) => "organization.remove_parent",
                OrganizationCommand::UpdateOnboardingStatus(_) => "organization.update_onboarding_status",
                OrganizationCommand::RefreshArr(_) => "organization.refresh_arr",
                OrganizationCommand::RefreshRenewalSummary(_) => "organization.refresh_renewal_summary",
            },
            OutboundCommand::Contract(c) => match c {
                ContractCommand::Create(_) => "contract.create",
                ContractCommand::Update(_) => "contract.update",
                ContractCommand::Delete(_) => "contract.delete",
                ContractCommand::RefreshStatus(_) => "contract.refresh_status",
            },
            OutboundCommand::Opportunity(c) => match c {
                OpportunityCommand::Create(_) => "opportunity.create",
                OpportunityCommand::Update(_) => "opportunity.update",
                OpportunityCommand::CreateRenewal(_) => "opportunity.create_renewal",
                OpportunityCommand::UpdateRenewal(_) => "opportunity.update_renewal",
                OpportunityCommand::UpdateNextCycleDate(_) => "opportunity.update_next_cycle_date",
                OpportunityCommand::CloseWon(_) => "opportunity.close_won",
                OpportunityCommand::CloseLost(_) => "opportunity.close_lost",
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("cascade command failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("cascade gateway unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous entry point into the command side for follow-up commands.
pub trait CommandGateway: Send + Sync {
    fn send(&self, command: OutboundCommand) -> Result<(), CascadeError>;
}

impl<G> CommandGateway for Arc<G>
where
    G: CommandGateway + ?Sized,
{
    fn send(&self, command: OutboundCommand) -> Result<(), CascadeError> {
        (**self).send(command)
    }
}

/// Provenance shared by every follow-up of one triggering event.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeContext {
    pub tenant: TenantId,
    /// Id of the triggering event.
    pub causation_id: Uuid,
    pub now: DateTime<Utc>,
}

impl CascadeContext {
    pub fn from_event(event: &RecordedEvent) -> Self {
        Self {
            tenant: event.metadata.tenant.clone(),
            causation_id: event.event_id,
            now: Utc::now(),
        }
    }

    pub fn from_envelope<E>(env: &EventEnvelope<E>) -> Self {
        Self {
            tenant: env.metadata().tenant.clone(),
            causation_id: env.event_id(),
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Command envelope: no acting user, subscriber app source, caused by the event.
    pub fn base(&self, entity_id: EntityId) -> BaseCommand {
        BaseCommand::new(self.tenant.clone(), entity_id, APP_SOURCE_SUBSCRIBERS).caused_by(self.causation_id)
    }

    pub fn source(&self) -> SourceFields {
        SourceFields::openline(APP_SOURCE_SUBSCRIBERS)
    }

    /// Stable id for an entity created in reaction to this event, so a redelivered
    /// event addresses the same aggregate instead of creating another.
    pub fn derived_id(&self, purpose: &str) -> EntityId {
        EntityId::from_uuid(Uuid::new_v5(&self.causation_id, purpose.as_bytes()))
    }
}

/// Issues follow-up commands and reads the inputs they need from the read model.
pub struct CascadeOrchestrator {
    read_model: Arc<dyn ReadModelStore>,
    gateway: Arc<dyn CommandGateway>,
}

impl CascadeOrchestrator {
    pub fn new(read_model: Arc<dyn ReadModelStore>, gateway: Arc<dyn CommandGateway>) -> Self {
        Self { read_model, gateway }
    }

    pub fn read_model(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    /// Send one follow-up. Failures are logged and reported as `false`.
    pub fn send(&self, ctx: &CascadeContext, command: OutboundCommand) -> bool {
        let name = command.name();
        let target = command.base().entity_id;
        match self.gateway.send(command) {
            Ok(()) => {
                debug!(tenant = %ctx.tenant, causation_id = %ctx.causation_id, command = name, %target, "cascade sent");
                true
            }
            Err(err) => {
                warn!(
                    tenant = %ctx.tenant,
                    causation_id = %ctx.causation_id,
                    command = name,
                    %target,
                    error = %err,
                    "cascade command failed"
                );
                false
            }
        }
    }

    pub fn refresh_arr(&self, ctx: &CascadeContext, organization_id: EntityId) -> bool {
        self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::RefreshArr(RefreshArr {
                base: ctx.base(organization_id),
            })),
        )
    }

    pub fn refresh_renewal_summary(&self, ctx: &CascadeContext, organization_id: EntityId) -> bool {
        self.send(
            ctx,
            OutboundCommand::Organization(OrganizationCommand::RefreshRenewalSummary(RefreshRenewalSummary {
                base: ctx.base(organization_id),
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use custos_events::EventMetadata;
    use custos_core::StreamId;

    use super::gateway::RecordingGateway;
    use super::*;
    use crate::read_model::InMemoryReadModel;

    fn event() -> RecordedEvent {
        let tenant = TenantId::new("acme");
        let id = EntityId::new();
        RecordedEvent {
            event_id: Uuid::now_v7(),
            stream_id: StreamId::for_entity("contract", &tenant, &id),
            aggregate_type: "contract".into(),
            event_type: "contract.updated".into(),
            version: 1,
            payload: serde_json::json!({}),
            metadata: EventMetadata::new(tenant, "web"),
        }
    }

    #[test]
    fn follow_ups_carry_causation_and_no_user() {
        let ctx = CascadeContext::from_event(&event());
        let base = ctx.base(EntityId::new());
        assert_eq!(base.causation_id, Some(ctx.causation_id));
        assert_eq!(base.user_id, None);
        assert_eq!(base.app_source, APP_SOURCE_SUBSCRIBERS);
    }

    #[test]
    fn derived_ids_are_stable_per_event_and_purpose() {
        let ctx = CascadeContext::from_event(&event());
        assert_eq!(ctx.derived_id("renewal"), ctx.derived_id("renewal"));
        assert_ne!(ctx.derived_id("renewal"), ctx.derived_id("other"));

        let other = CascadeContext::from_event(&event());
        assert_ne!(ctx.derived_id("renewal"), other.derived_id("renewal"));
    }

    #[test]
    fn failed_sends_are_swallowed() {
        let gateway = Arc::new(RecordingGateway::failing());
        let orchestrator = CascadeOrchestrator::new(Arc::new(InMemoryReadModel::new()), gateway.clone());
        let ctx = CascadeContext::from_event(&event());

        assert!(!orchestrator.refresh_arr(&ctx, EntityId::new()));
        assert_eq!(gateway.sent().len(), 1);
    }
}
