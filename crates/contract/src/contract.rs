use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{
    Aggregate, AggregateRoot, DomainError, EntityId, ExternalSystem, FieldMask, SOURCE_OPENLINE,
    SourceFields, UserId,
};
use custos_events::{BaseCommand, Command, impl_event_codec};

/// Months per billing cycle for the textual cycle names used by sync sources.
pub fn billing_cycle_in_months(cycle: &str) -> i64 {
    match cycle {
        "MONTHLY" => 1,
        "QUARTERLY" => 3,
        "ANNUALLY" => 12,
        _ => 0,
    }
}

/// Writable contract fields.
///
/// `length_in_months` is the renewal cycle. Zero means the contract does not renew.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractFields {
    pub name: String,
    pub contract_url: String,
    pub service_started_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub length_in_months: i64,
    pub billing_cycle_in_months: i64,
    pub currency: String,
    pub approved: bool,
    pub auto_renew: bool,
    pub invoicing_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractField {
    Name,
    ContractUrl,
    ServiceStartedAt,
    SignedAt,
    EndedAt,
    LengthInMonths,
    BillingCycle,
    Currency,
    Approved,
    AutoRenew,
    InvoicingEnabled,
}

/// Aggregate root: Contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    id: EntityId,
    organization_id: Option<EntityId>,
    fields: ContractFields,
    source_of_truth: String,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Contract {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            organization_id: None,
            fields: ContractFields::default(),
            source_of_truth: String::new(),
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn organization_id(&self) -> Option<EntityId> {
        self.organization_id
    }

    pub fn fields(&self) -> &ContractFields {
        &self.fields
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl AggregateRoot for Contract {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "contract";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateContract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContract {
    pub base: BaseCommand,
    pub organization_id: EntityId,
    pub fields: ContractFields,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

/// Command: UpdateContract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateContract {
    pub base: BaseCommand,
    pub fields: ContractFields,
    pub mask: FieldMask<ContractField>,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteContract {
    pub base: BaseCommand,
}

/// Command: RefreshContractStatus. Asks the projection side to re-derive the status
/// (e.g. when a date boundary passes without any field changing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshContractStatus {
    pub base: BaseCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContractCommand {
    Create(CreateContract),
    Update(UpdateContract),
    Delete(DeleteContract),
    RefreshStatus(RefreshContractStatus),
}

impl Command for ContractCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            ContractCommand::Create(c) => &c.base,
            ContractCommand::Update(c) => &c.base,
            ContractCommand::Delete(c) => &c.base,
            ContractCommand::RefreshStatus(c) => &c.base,
        }
    }
}

/// Event: ContractCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreated {
    pub organization_id: EntityId,
    pub fields: ContractFields,
    #[serde(default)]
    pub created_by: Option<UserId>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

/// Event: ContractUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractUpdated {
    pub fields: ContractFields,
    #[serde(default)]
    pub mask: FieldMask<ContractField>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDeleted {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractStatusRefreshRequested {}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractEvent {
    Created(ContractCreated),
    Updated(ContractUpdated),
    Deleted(ContractDeleted),
    StatusRefreshRequested(ContractStatusRefreshRequested),
}

impl_event_codec!(ContractEvent {
    Created => "contract.created",
    Updated => "contract.updated",
    Deleted => "contract.deleted",
    StatusRefreshRequested => "contract.status_refresh_requested",
});

impl Aggregate for Contract {
    type Command = ContractCommand;
    type Event = ContractEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ContractEvent::Created(e) => {
                self.organization_id = Some(e.organization_id);
                self.fields = e.fields.clone();
                self.source_of_truth = e.source.source_of_truth.clone();
                self.created = true;
            }
            ContractEvent::Updated(e) => {
                self.apply_update(e);
                self.created = true;
            }
            ContractEvent::Deleted(_) => {
                self.deleted = true;
            }
            ContractEvent::StatusRefreshRequested(_) => {}
        }

        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.base().entity_id != self.id {
            return Err(DomainError::invariant("contract id mismatch"));
        }
        match command {
            ContractCommand::Create(cmd) => self.handle_create(cmd),
            ContractCommand::Update(cmd) => self.handle_update(cmd),
            ContractCommand::Delete(_) => {
                if self.deleted {
                    return Ok(vec![]);
                }
                Ok(vec![ContractEvent::Deleted(ContractDeleted {})])
            }
            ContractCommand::RefreshStatus(_) => {
                if !self.created {
                    return Err(DomainError::missing(Self::AGGREGATE_TYPE, self.id));
                }
                Ok(vec![ContractEvent::StatusRefreshRequested(
                    ContractStatusRefreshRequested {},
                )])
            }
        }
    }
}

impl Contract {
    fn handle_create(&self, cmd: &CreateContract) -> Result<Vec<ContractEvent>, DomainError> {
        if self.created {
            return Ok(vec![]);
        }
        validate_fields(&cmd.fields)?;
        Ok(vec![ContractEvent::Created(ContractCreated {
            organization_id: cmd.organization_id,
            fields: cmd.fields.clone(),
            created_by: cmd.base.user_id,
            source: cmd.source.clone(),
            external_system: cmd.external_system.clone(),
        })])
    }

    fn handle_update(&self, cmd: &UpdateContract) -> Result<Vec<ContractEvent>, DomainError> {
        if self.deleted {
            return Err(DomainError::validation("contract is deleted"));
        }

        // Validate the dates the contract would end up with, not just the incoming ones.
        let mut effective = self.fields.clone();
        let mask = &cmd.mask;
        if mask.includes(ContractField::ServiceStartedAt) {
            effective.service_started_at = cmd.fields.service_started_at;
        }
        if mask.includes(ContractField::SignedAt) {
            effective.signed_at = cmd.fields.signed_at;
        }
        if mask.includes(ContractField::EndedAt) {
            effective.ended_at = cmd.fields.ended_at;
        }
        if mask.includes(ContractField::LengthInMonths) {
            effective.length_in_months = cmd.fields.length_in_months;
        }
        validate_fields(&effective)?;

        Ok(vec![ContractEvent::Updated(ContractUpdated {
            fields: cmd.fields.clone(),
            mask: cmd.mask.clone(),
            source: cmd.source.clone(),
            external_system: cmd.external_system.clone(),
        })])
    }

    fn apply_update(&mut self, e: &ContractUpdated) {
        let fill_only = SourceFields::fill_only(&self.source_of_truth, &e.source);
        if e.source.source == SOURCE_OPENLINE {
            self.source_of_truth = SOURCE_OPENLINE.to_string();
        } else if self.source_of_truth.is_empty() {
            self.source_of_truth = e.source.source_of_truth.clone();
        }

        let mask = &e.mask;
        let incoming = &e.fields;
        let current = &mut self.fields;
        if fill_only {
            if mask.includes(ContractField::Name) && current.name.is_empty() {
                current.name = incoming.name.clone();
            }
            if mask.includes(ContractField::ContractUrl) && current.contract_url.is_empty() {
                current.contract_url = incoming.contract_url.clone();
            }
            return;
        }

        if mask.includes(ContractField::Name) {
            current.name = incoming.name.clone();
        }
        if mask.includes(ContractField::ContractUrl) {
            current.contract_url = incoming.contract_url.clone();
        }
        if mask.includes(ContractField::ServiceStartedAt) {
            current.service_started_at = incoming.service_started_at;
        }
        if mask.includes(ContractField::SignedAt) {
            current.signed_at = incoming.signed_at;
        }
        if mask.includes(ContractField::EndedAt) {
            current.ended_at = incoming.ended_at;
        }
        if mask.includes(ContractField::LengthInMonths) {
            current.length_in_months = incoming.length_in_months;
        }
        if mask.includes(ContractField::BillingCycle) {
            current.billing_cycle_in_months = incoming.billing_cycle_in_months;
        }
        if mask.includes(ContractField::Currency) {
            current.currency = incoming.currency.clone();
        }
        if mask.includes(ContractField::Approved) {
            current.approved = incoming.approved;
        }
        if mask.includes(ContractField::AutoRenew) {
            current.auto_renew = incoming.auto_renew;
        }
        if mask.includes(ContractField::InvoicingEnabled) {
            current.invoicing_enabled = incoming.invoicing_enabled;
        }
    }
}

fn validate_fields(fields: &ContractFields) -> Result<(), DomainError> {
    if fields.length_in_months < 0 {
        return Err(DomainError::validation("length in months cannot be negative"));
    }
    if let Some(ended_at) = fields.ended_at {
        let before_signed = fields.signed_at.is_some_and(|signed| ended_at < signed);
        let before_started = fields.service_started_at.is_some_and(|started| ended_at < started);
        if before_signed || before_started {
            return Err(DomainError::validation(
                "endedAt date must be after both signedAt and serviceStartedAt dates",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use custos_core::TenantId;

    fn base(id: EntityId) -> BaseCommand {
        BaseCommand::new(TenantId::new("acme"), id, "web")
    }

    fn created(fields: ContractFields) -> Contract {
        let id = EntityId::new();
        let mut contract = Contract::empty(id);
        let events = contract
            .handle(&ContractCommand::Create(CreateContract {
                base: base(id),
                organization_id: EntityId::new(),
                fields,
                source: SourceFields::openline("web"),
                external_system: ExternalSystem::default(),
            }))
            .unwrap();
        contract.apply(&events[0]);
        contract
    }

    fn update(contract: &Contract, fields: ContractFields, mask: FieldMask<ContractField>, source: &str) -> Result<Vec<ContractEvent>, DomainError> {
        contract.handle(&ContractCommand::Update(UpdateContract {
            base: base(*contract.id()),
            fields,
            mask,
            source: SourceFields::new(source, "sync"),
            external_system: ExternalSystem::default(),
        }))
    }

    #[test]
    fn billing_cycle_names_map_to_months() {
        assert_eq!(billing_cycle_in_months("MONTHLY"), 1);
        assert_eq!(billing_cycle_in_months("QUARTERLY"), 3);
        assert_eq!(billing_cycle_in_months("ANNUALLY"), 12);
        assert_eq!(billing_cycle_in_months("WEEKLY"), 0);
    }

    #[test]
    fn update_rejects_end_before_start() {
        let now = Utc::now();
        let contract = created(ContractFields {
            service_started_at: Some(now),
            signed_at: Some(now - Duration::days(5)),
            ..Default::default()
        });

        let err = update(
            &contract,
            ContractFields {
                ended_at: Some(now - Duration::days(1)),
                ..Default::default()
            },
            FieldMask::only([ContractField::EndedAt]),
            "openline",
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn masked_update_clears_renewal_cycle_only() {
        let mut contract = created(ContractFields {
            name: "MSA".into(),
            length_in_months: 12,
            auto_renew: true,
            ..Default::default()
        });
        let events = update(
            &contract,
            ContractFields::default(),
            FieldMask::only([ContractField::LengthInMonths]),
            "openline",
        )
        .unwrap();
        contract.apply(&events[0]);

        assert_eq!(contract.fields().length_in_months, 0);
        assert_eq!(contract.fields().name, "MSA");
        assert!(contract.fields().auto_renew);
    }

    #[test]
    fn external_update_fills_only_empty_text_fields() {
        let mut contract = created(ContractFields {
            name: "MSA".into(),
            length_in_months: 12,
            ..Default::default()
        });
        let events = update(
            &contract,
            ContractFields {
                name: "Synced name".into(),
                contract_url: "https://docs/msa".into(),
                length_in_months: 1,
                ..Default::default()
            },
            FieldMask::all(),
            "hubspot",
        )
        .unwrap();
        contract.apply(&events[0]);

        assert_eq!(contract.fields().name, "MSA");
        assert_eq!(contract.fields().contract_url, "https://docs/msa");
        assert_eq!(contract.fields().length_in_months, 12);
    }

    #[test]
    fn delete_is_idempotent_and_blocks_updates() {
        let mut contract = created(ContractFields::default());
        let delete = ContractCommand::Delete(DeleteContract { base: base(*contract.id()) });
        let events = contract.handle(&delete).unwrap();
        contract.apply(&events[0]);

        assert!(contract.handle(&delete).unwrap().is_empty());
        assert!(update(&contract, ContractFields::default(), FieldMask::all(), "openline").is_err());
    }

    #[test]
    fn refresh_status_requires_an_existing_contract() {
        let id = EntityId::new();
        let contract = Contract::empty(id);
        let err = contract
            .handle(&ContractCommand::RefreshStatus(RefreshContractStatus { base: base(id) }))
            .unwrap_err();
        assert_eq!(err, DomainError::missing("contract", id));
    }
}
