use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{
    Aggregate, AggregateRoot, DomainError, EntityId, ExternalSystem, FieldMask, SOURCE_OPENLINE,
    SourceFields, UserId,
};
use custos_events::{BaseCommand, Command, impl_event_codec};

use crate::renewal::{RenewalDetails, RenewalField, RenewalLikelihood, RenewalUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalStage {
    #[default]
    Open,
    ClosedWon,
    ClosedLost,
    Suspended,
}

impl InternalStage {
    pub fn is_closed(self) -> bool {
        matches!(self, InternalStage::ClosedWon | InternalStage::ClosedLost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalType {
    #[default]
    NewBusiness,
    Renewal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityFields {
    pub name: String,
    pub amount: f64,
    pub max_amount: f64,
    pub internal_type: InternalType,
    pub internal_stage: InternalStage,
    pub external_type: String,
    pub external_stage: String,
    pub estimated_closed_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<UserId>,
    pub general_notes: String,
    pub next_steps: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityField {
    Name,
    Amount,
    MaxAmount,
    InternalStage,
    ExternalType,
    ExternalStage,
    EstimatedClosedAt,
    Owner,
    GeneralNotes,
    NextSteps,
}

/// Aggregate root: Opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    id: EntityId,
    organization_id: Option<EntityId>,
    fields: OpportunityFields,
    renewal: RenewalDetails,
    source_of_truth: String,
    closed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Opportunity {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            organization_id: None,
            fields: OpportunityFields::default(),
            renewal: RenewalDetails::default(),
            source_of_truth: String::new(),
            closed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn organization_id(&self) -> Option<EntityId> {
        self.organization_id
    }

    pub fn fields(&self) -> &OpportunityFields {
        &self.fields
    }

    pub fn renewal(&self) -> &RenewalDetails {
        &self.renewal
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn is_renewal(&self) -> bool {
        self.fields.internal_type == InternalType::Renewal
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Opportunity {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "opportunity";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ---- Commands ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOpportunity {
    pub base: BaseCommand,
    pub organization_id: Option<EntityId>,
    pub fields: OpportunityFields,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOpportunity {
    pub base: BaseCommand,
    pub fields: OpportunityFields,
    pub mask: FieldMask<OpportunityField>,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRenewalOpportunity {
    pub base: BaseCommand,
    pub contract_id: EntityId,
    pub likelihood: Option<RenewalLikelihood>,
    pub adjusted_rate: i64,
    pub approved: bool,
    pub renewed_at: Option<DateTime<Utc>>,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRenewalOpportunity {
    pub base: BaseCommand,
    pub update: RenewalUpdate,
    pub mask: FieldMask<RenewalField>,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRenewalNextCycleDate {
    pub base: BaseCommand,
    pub renewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseWonOpportunity {
    pub base: BaseCommand,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseLostOpportunity {
    pub base: BaseCommand,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpportunityCommand {
    Create(CreateOpportunity),
    Update(UpdateOpportunity),
    CreateRenewal(CreateRenewalOpportunity),
    UpdateRenewal(UpdateRenewalOpportunity),
    UpdateNextCycleDate(UpdateRenewalNextCycleDate),
    CloseWon(CloseWonOpportunity),
    CloseLost(CloseLostOpportunity),
}

impl Command for OpportunityCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            OpportunityCommand::Create(c) => &c.base,
            OpportunityCommand::Update(c) => &c.base,
            OpportunityCommand::CreateRenewal(c) => &c.base,
            OpportunityCommand::UpdateRenewal(c) => &c.base,
            OpportunityCommand::UpdateNextCycleDate(c) => &c.base,
            OpportunityCommand::CloseWon(c) => &c.base,
            OpportunityCommand::CloseLost(c) => &c.base,
        }
    }
}

// ---- Events ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityCreated {
    #[serde(default)]
    pub organization_id: Option<EntityId>,
    pub fields: OpportunityFields,
    #[serde(default)]
    pub created_by: Option<UserId>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityUpdated {
    pub fields: OpportunityFields,
    #[serde(default)]
    pub mask: FieldMask<OpportunityField>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalCreated {
    pub contract_id: EntityId,
    pub likelihood: RenewalLikelihood,
    pub adjusted_rate: i64,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalUpdated {
    pub update: RenewalUpdate,
    #[serde(default)]
    pub mask: FieldMask<RenewalField>,
    pub source: SourceFields,
    /// Set only for user-initiated updates that changed the amount or likelihood.
    #[serde(default)]
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalNextCycleDateUpdated {
    pub renewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityClosedWon {
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityClosedLost {
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpportunityEvent {
    Created(OpportunityCreated),
    Updated(OpportunityUpdated),
    RenewalCreated(RenewalCreated),
    RenewalUpdated(RenewalUpdated),
    NextCycleDateUpdated(RenewalNextCycleDateUpdated),
    ClosedWon(OpportunityClosedWon),
    ClosedLost(OpportunityClosedLost),
}

impl_event_codec!(OpportunityEvent {
    Created => "opportunity.created",
    Updated => "opportunity.updated",
    RenewalCreated => "opportunity.renewal_created",
    RenewalUpdated => "opportunity.renewal_updated",
    NextCycleDateUpdated => "opportunity.next_cycle_date_updated",
    ClosedWon => "opportunity.closed_won",
    ClosedLost => "opportunity.closed_lost",
});

impl Aggregate for Opportunity {
    type Command = OpportunityCommand;
    type Event = OpportunityEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OpportunityEvent::Created(e) => {
                self.organization_id = e.organization_id;
                self.fields = e.fields.clone();
                self.source_of_truth = e.source.source_of_truth.clone();
                self.created = true;
            }
            OpportunityEvent::Updated(e) => {
                self.apply_update(e);
                self.created = true;
            }
            OpportunityEvent::RenewalCreated(e) => {
                self.fields.internal_type = InternalType::Renewal;
                self.fields.internal_stage = InternalStage::Open;
                self.renewal.contract_id = Some(e.contract_id);
                self.renewal.likelihood = Some(e.likelihood);
                self.renewal.adjusted_rate = e.adjusted_rate;
                self.renewal.approved = e.approved;
                self.renewal.renewed_at = e.renewed_at;
                self.source_of_truth = e.source.source_of_truth.clone();
                self.created = true;
            }
            OpportunityEvent::RenewalUpdated(e) => self.apply_renewal_update(e),
            OpportunityEvent::NextCycleDateUpdated(e) => {
                self.renewal.renewed_at = e.renewed_at;
            }
            OpportunityEvent::ClosedWon(e) => {
                self.fields.internal_stage = InternalStage::ClosedWon;
                self.closed_at = Some(e.closed_at);
            }
            OpportunityEvent::ClosedLost(e) => {
                self.fields.internal_stage = InternalStage::ClosedLost;
                self.closed_at = Some(e.closed_at);
            }
        }

        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.base().entity_id != self.id {
            return Err(DomainError::invariant("opportunity id mismatch"));
        }
        match command {
            OpportunityCommand::Create(cmd) => {
                if self.created {
                    return Ok(vec![]);
                }
                Ok(vec![OpportunityEvent::Created(OpportunityCreated {
                    organization_id: cmd.organization_id,
                    fields: cmd.fields.clone(),
                    created_by: cmd.base.user_id,
                    source: cmd.source.clone(),
                    external_system: cmd.external_system.clone(),
                })])
            }
            OpportunityCommand::Update(cmd) => Ok(vec![OpportunityEvent::Updated(OpportunityUpdated {
                fields: cmd.fields.clone(),
                mask: cmd.mask.clone(),
                source: cmd.source.clone(),
                external_system: cmd.external_system.clone(),
            })]),
            OpportunityCommand::CreateRenewal(cmd) => {
                if self.created {
                    return Ok(vec![]);
                }
                let (likelihood, adjusted_rate) =
                    RenewalDetails::normalized_for_create(cmd.likelihood, cmd.adjusted_rate);
                Ok(vec![OpportunityEvent::RenewalCreated(RenewalCreated {
                    contract_id: cmd.contract_id,
                    likelihood,
                    adjusted_rate,
                    approved: cmd.approved,
                    renewed_at: cmd.renewed_at,
                    source: cmd.source.clone(),
                })])
            }
            OpportunityCommand::UpdateRenewal(cmd) => self.handle_update_renewal(cmd),
            OpportunityCommand::UpdateNextCycleDate(cmd) => {
                self.ensure_open_renewal()?;
                if self.renewal.renewed_at == cmd.renewed_at {
                    return Ok(vec![]);
                }
                Ok(vec![OpportunityEvent::NextCycleDateUpdated(
                    RenewalNextCycleDateUpdated {
                        renewed_at: cmd.renewed_at,
                    },
                )])
            }
            OpportunityCommand::CloseWon(cmd) => {
                if self.fields.internal_stage.is_closed() {
                    return Ok(vec![]);
                }
                Ok(vec![OpportunityEvent::ClosedWon(OpportunityClosedWon {
                    closed_at: cmd.closed_at.unwrap_or_else(Utc::now),
                })])
            }
            OpportunityCommand::CloseLost(cmd) => {
                if self.fields.internal_stage.is_closed() {
                    return Ok(vec![]);
                }
                Ok(vec![OpportunityEvent::ClosedLost(OpportunityClosedLost {
                    closed_at: cmd.closed_at.unwrap_or_else(Utc::now),
                })])
            }
        }
    }
}

impl Opportunity {
    fn ensure_open_renewal(&self) -> Result<(), DomainError> {
        if !self.is_renewal() {
            return Err(DomainError::validation("Opportunity is not renewal"));
        }
        if self.fields.internal_stage != InternalStage::Open {
            return Err(DomainError::validation("Opportunity is closed"));
        }
        Ok(())
    }

    fn handle_update_renewal(&self, cmd: &UpdateRenewalOpportunity) -> Result<Vec<OpportunityEvent>, DomainError> {
        if self.created && !self.is_renewal() {
            return Err(DomainError::validation("Opportunity is not renewal"));
        }
        let update = cmd.update.clone().normalized();
        let mask = &cmd.mask;

        let amount_changed = mask.includes(RenewalField::Amount) && update.amount != self.fields.amount;
        let likelihood_changed =
            mask.includes(RenewalField::Likelihood) && update.likelihood != self.renewal.likelihood;
        let updated_by = cmd
            .base
            .user_id
            .filter(|_| amount_changed || likelihood_changed);

        Ok(vec![OpportunityEvent::RenewalUpdated(RenewalUpdated {
            update,
            mask: cmd.mask.clone(),
            source: cmd.source.clone(),
            updated_by,
        })])
    }

    fn apply_update(&mut self, e: &OpportunityUpdated) {
        let fill_only = SourceFields::fill_only(&self.source_of_truth, &e.source);
        if e.source.source == SOURCE_OPENLINE {
            self.source_of_truth = SOURCE_OPENLINE.to_string();
        }

        let mask = &e.mask;
        let incoming = &e.fields;
        let current = &mut self.fields;
        if fill_only {
            if mask.includes(OpportunityField::Name) && current.name.is_empty() {
                current.name = incoming.name.clone();
            }
            return;
        }

        if mask.includes(OpportunityField::Name) {
            current.name = incoming.name.clone();
        }
        if mask.includes(OpportunityField::Amount) {
            current.amount = incoming.amount;
        }
        if mask.includes(OpportunityField::MaxAmount) {
            current.max_amount = incoming.max_amount;
        }
        if mask.includes(OpportunityField::InternalStage) {
            current.internal_stage = incoming.internal_stage;
        }
        if mask.includes(OpportunityField::ExternalType) {
            current.external_type = incoming.external_type.clone();
        }
        if mask.includes(OpportunityField::ExternalStage) {
            current.external_stage = incoming.external_stage.clone();
        }
        if mask.includes(OpportunityField::EstimatedClosedAt) {
            current.estimated_closed_at = incoming.estimated_closed_at;
        }
        if mask.includes(OpportunityField::Owner) {
            current.owner_user_id = incoming.owner_user_id;
        }
        if mask.includes(OpportunityField::GeneralNotes) {
            current.general_notes = incoming.general_notes.clone();
        }
        if mask.includes(OpportunityField::NextSteps) {
            current.next_steps = incoming.next_steps.clone();
        }
    }

    fn apply_renewal_update(&mut self, e: &RenewalUpdated) {
        let mask = &e.mask;
        let update = &e.update;
        if mask.includes(RenewalField::Likelihood) {
            self.renewal.likelihood = update.likelihood;
        }
        if mask.includes(RenewalField::AdjustedRate) {
            self.renewal.adjusted_rate = update.adjusted_rate;
        }
        if mask.includes(RenewalField::Amount) {
            self.fields.amount = update.amount;
        }
        if mask.includes(RenewalField::MaxAmount) {
            self.fields.max_amount = update.max_amount;
        }
        if mask.includes(RenewalField::Comments) {
            self.renewal.comments = update.comments.clone();
        }
        if mask.includes(RenewalField::Approved) {
            self.renewal.approved = update.approved;
        }
        if mask.includes(RenewalField::Owner) {
            self.fields.owner_user_id = update.owner_user_id;
        }
        if mask.includes(RenewalField::RenewedAt) {
            self.renewal.renewed_at = update.renewed_at;
        }
        if e.updated_by.is_some() {
            self.renewal.updated_by = e.updated_by;
        }
        self.fields.internal_type = InternalType::Renewal;
        self.created = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::TenantId;

    fn base(id: EntityId) -> BaseCommand {
        BaseCommand::new(TenantId::new("acme"), id, "web")
    }

    fn run(opp: &mut Opportunity, command: OpportunityCommand) -> Vec<OpportunityEvent> {
        let events = opp.handle(&command).unwrap();
        for e in &events {
            opp.apply(e);
        }
        events
    }

    fn renewal() -> Opportunity {
        let id = EntityId::new();
        let mut opp = Opportunity::empty(id);
        run(
            &mut opp,
            OpportunityCommand::CreateRenewal(CreateRenewalOpportunity {
                base: base(id),
                contract_id: EntityId::new(),
                likelihood: None,
                adjusted_rate: 0,
                approved: false,
                renewed_at: None,
                source: SourceFields::default(),
            }),
        );
        opp
    }

    fn update_renewal(opp: &Opportunity, update: RenewalUpdate, mask: FieldMask<RenewalField>, user: Option<UserId>) -> RenewalUpdated {
        let mut cmd_base = base(*opp.id());
        cmd_base.user_id = user;
        let events = opp
            .handle(&OpportunityCommand::UpdateRenewal(UpdateRenewalOpportunity {
                base: cmd_base,
                update,
                mask,
                source: SourceFields::default(),
            }))
            .unwrap();
        match events.into_iter().next() {
            Some(OpportunityEvent::RenewalUpdated(e)) => e,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn new_renewal_is_open_and_high() {
        let opp = renewal();
        assert!(opp.is_renewal());
        assert_eq!(opp.fields().internal_stage, InternalStage::Open);
        assert_eq!(opp.renewal().likelihood, Some(RenewalLikelihood::High));
        assert_eq!(opp.renewal().adjusted_rate, 100);
    }

    #[test]
    fn amount_update_keeps_other_fields() {
        let id = EntityId::new();
        let mut opp = Opportunity::empty(id);
        run(
            &mut opp,
            OpportunityCommand::Create(CreateOpportunity {
                base: base(id),
                organization_id: Some(EntityId::new()),
                fields: OpportunityFields {
                    name: "Upsell".into(),
                    amount: 100.0,
                    next_steps: "call".into(),
                    ..Default::default()
                },
                source: SourceFields::default(),
                external_system: ExternalSystem::default(),
            }),
        );
        run(
            &mut opp,
            OpportunityCommand::Update(UpdateOpportunity {
                base: base(id),
                fields: OpportunityFields {
                    amount: 150.0,
                    ..Default::default()
                },
                mask: FieldMask::only([OpportunityField::Amount]),
                source: SourceFields::default(),
                external_system: ExternalSystem::default(),
            }),
        );

        assert_eq!(opp.fields().amount, 150.0);
        assert_eq!(opp.fields().name, "Upsell");
        assert_eq!(opp.fields().next_steps, "call");
    }

    #[test]
    fn comment_only_edit_does_not_attribute_the_user() {
        let opp = renewal();
        let user = UserId::new();
        let event = update_renewal(
            &opp,
            RenewalUpdate {
                likelihood: Some(RenewalLikelihood::High),
                adjusted_rate: 100,
                comments: "checked in".into(),
                ..Default::default()
            },
            FieldMask::only([RenewalField::Comments, RenewalField::Likelihood]),
            Some(user),
        );
        assert_eq!(event.updated_by, None);
    }

    #[test]
    fn likelihood_change_by_user_is_attributed() {
        let opp = renewal();
        let user = UserId::new();
        let event = update_renewal(
            &opp,
            RenewalUpdate {
                likelihood: Some(RenewalLikelihood::Low),
                adjusted_rate: 25,
                ..Default::default()
            },
            FieldMask::only([RenewalField::Likelihood, RenewalField::AdjustedRate]),
            Some(user),
        );
        assert_eq!(event.updated_by, Some(user));

        let system = update_renewal(
            &opp,
            RenewalUpdate {
                likelihood: Some(RenewalLikelihood::Low),
                ..Default::default()
            },
            FieldMask::only([RenewalField::Likelihood]),
            None,
        );
        assert_eq!(system.updated_by, None);
    }

    #[test]
    fn next_cycle_date_requires_an_open_renewal() {
        let id = EntityId::new();
        let new_business = Opportunity::empty(id);
        let err = new_business
            .handle(&OpportunityCommand::UpdateNextCycleDate(UpdateRenewalNextCycleDate {
                base: base(id),
                renewed_at: Some(Utc::now()),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::validation("Opportunity is not renewal"));

        let mut opp = renewal();
        let id = *opp.id();
        run(
            &mut opp,
            OpportunityCommand::CloseWon(CloseWonOpportunity {
                base: base(id),
                closed_at: None,
            }),
        );
        let err = opp
            .handle(&OpportunityCommand::UpdateNextCycleDate(UpdateRenewalNextCycleDate {
                base: base(*opp.id()),
                renewed_at: Some(Utc::now()),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::validation("Opportunity is closed"));
    }

    #[test]
    fn closing_is_terminal() {
        let mut opp = renewal();
        let id = *opp.id();
        run(
            &mut opp,
            OpportunityCommand::CloseLost(CloseLostOpportunity {
                base: base(id),
                closed_at: None,
            }),
        );
        assert_eq!(opp.fields().internal_stage, InternalStage::ClosedLost);
        assert!(opp.closed_at().is_some());

        let events = opp
            .handle(&OpportunityCommand::CloseWon(CloseWonOpportunity {
                base: base(*opp.id()),
                closed_at: None,
            }))
            .unwrap();
        assert!(events.is_empty());
    }
}
