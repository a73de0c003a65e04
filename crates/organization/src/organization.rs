use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use custos_core::{
    Aggregate, AggregateRoot, DomainError, EntityId, ExternalSystem, FieldMask, SOURCE_OPENLINE,
    SourceFields, UserId,
};
use custos_events::{BaseCommand, Command, impl_event_codec};

use crate::onboarding::OnboardingStatus;

/// Commercial relationship between the tenant and an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    Customer,
    Prospect,
    FormerCustomer,
    NotAFit,
}

/// Position of an organization in the sales funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Lead,
    Target,
    Engaged,
    Trial,
    InitialValue,
    RecurringValue,
    MaxValue,
    PendingChurn,
    Unqualified,
}

/// Writable profile fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationFields {
    pub name: String,
    pub description: String,
    pub website: String,
    pub industry: String,
    pub employees: i64,
    pub relationship: Option<Relationship>,
    pub stage: Option<Stage>,
    pub hide: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationField {
    Name,
    Description,
    Website,
    Industry,
    Employees,
    Relationship,
    Stage,
    Hide,
}

/// Aggregate root: Organization.
#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    id: EntityId,
    fields: OrganizationFields,
    source_of_truth: String,
    parents: BTreeMap<EntityId, String>,
    onboarding_status: OnboardingStatus,
    onboarding_comments: String,
    version: u64,
    created: bool,
}

impl Organization {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            fields: OrganizationFields::default(),
            source_of_truth: String::new(),
            parents: BTreeMap::new(),
            onboarding_status: OnboardingStatus::NotApplicable,
            onboarding_comments: String::new(),
            version: 0,
            created: false,
        }
    }

    pub fn fields(&self) -> &OrganizationFields {
        &self.fields
    }

    pub fn source_of_truth(&self) -> &str {
        &self.source_of_truth
    }

    pub fn parents(&self) -> &BTreeMap<EntityId, String> {
        &self.parents
    }

    pub fn onboarding_status(&self) -> OnboardingStatus {
        self.onboarding_status
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Organization {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "organization";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrganization. A no-op when the organization already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrganization {
    pub base: BaseCommand,
    pub fields: OrganizationFields,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

/// Command: UpdateOrganization. Touches only the masked fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOrganization {
    pub base: BaseCommand,
    pub fields: OrganizationFields,
    pub mask: FieldMask<OrganizationField>,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

/// Command: AddParent (make this organization a subsidiary of `parent_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddParent {
    pub base: BaseCommand,
    pub parent_id: EntityId,
    pub relation_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveParent {
    pub base: BaseCommand,
    pub parent_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOnboardingStatus {
    pub base: BaseCommand,
    pub status: OnboardingStatus,
    pub comments: String,
    pub caused_by_contract_id: Option<EntityId>,
}

/// Command: RefreshArr. Asks the projection side to recompute the ARR forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshArr {
    pub base: BaseCommand,
}

/// Command: RefreshRenewalSummary. Asks the projection side to recompute the
/// next renewal date and lowest renewal likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRenewalSummary {
    pub base: BaseCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrganizationCommand {
    Create(CreateOrganization),
    Update(UpdateOrganization),
    AddParent(AddParent),
    RemoveParent(RemoveParent),
    UpdateOnboardingStatus(UpdateOnboardingStatus),
    RefreshArr(RefreshArr),
    RefreshRenewalSummary(RefreshRenewalSummary),
}

impl Command for OrganizationCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            OrganizationCommand::Create(c) => &c.base,
            OrganizationCommand::Update(c) => &c.base,
            OrganizationCommand::AddParent(c) => &c.base,
            OrganizationCommand::RemoveParent(c) => &c.base,
            OrganizationCommand::UpdateOnboardingStatus(c) => &c.base,
            OrganizationCommand::RefreshArr(c) => &c.base,
            OrganizationCommand::RefreshRenewalSummary(c) => &c.base,
        }
    }
}

/// Event: OrganizationCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCreated {
    pub fields: OrganizationFields,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

/// Event: OrganizationUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationUpdated {
    pub fields: OrganizationFields,
    #[serde(default)]
    pub mask: FieldMask<OrganizationField>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentAdded {
    pub parent_id: EntityId,
    #[serde(default)]
    pub relation_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRemoved {
    pub parent_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingStatusUpdated {
    pub status: OnboardingStatus,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub caused_by_contract_id: Option<EntityId>,
    #[serde(default)]
    pub updated_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrRefreshed {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalSummaryRefreshed {}

#[derive(Debug, Clone, PartialEq)]
pub enum OrganizationEvent {
    Created(OrganizationCreated),
    Updated(OrganizationUpdated),
    ParentAdded(ParentAdded),
    ParentRemoved(ParentRemoved),
    OnboardingStatusUpdated(OnboardingStatusUpdated),
    ArrRefreshed(ArrRefreshed),
    RenewalSummaryRefreshed(RenewalSummaryRefreshed),
}

impl_event_codec!(OrganizationEvent {
    Created => "organization.created",
    Updated => "organization.updated",
    ParentAdded => "organization.parent_added",
    ParentRemoved => "organization.parent_removed",
    OnboardingStatusUpdated => "organization.onboarding_status_updated",
    ArrRefreshed => "organization.arr_refreshed",
    RenewalSummaryRefreshed => "organization.renewal_summary_refreshed",
});

impl Aggregate for Organization {
    type Command = OrganizationCommand;
    type Event = OrganizationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrganizationEvent::Created(e) => {
                self.fields = e.fields.clone();
                self.source_of_truth = e.source.source_of_truth.clone();
                self.created = true;
            }
            OrganizationEvent::Updated(e) => {
                self.apply_update(e);
                self.created = true;
            }
            OrganizationEvent::ParentAdded(e) => {
                self.parents.insert(e.parent_id, e.relation_type.clone());
            }
            OrganizationEvent::ParentRemoved(e) => {
                self.parents.remove(&e.parent_id);
            }
            OrganizationEvent::OnboardingStatusUpdated(e) => {
                self.onboarding_status = e.status;
                self.onboarding_comments = e.comments.clone();
            }
            // Derived figures live in the read model.
            OrganizationEvent::ArrRefreshed(_) | OrganizationEvent::RenewalSummaryRefreshed(_) => {}
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        self.ensure_target(command.base())?;
        match command {
            OrganizationCommand::Create(cmd) => Ok(self.handle_create(cmd)),
            OrganizationCommand::Update(cmd) => Ok(vec![OrganizationEvent::Updated(
                OrganizationUpdated {
                    fields: cmd.fields.clone(),
                    mask: cmd.mask.clone(),
                    source: cmd.source.clone(),
                    external_system: cmd.external_system.clone(),
                },
            )]),
            OrganizationCommand::AddParent(cmd) => self.handle_add_parent(cmd),
            OrganizationCommand::RemoveParent(cmd) => Ok(self.handle_remove_parent(cmd)),
            OrganizationCommand::UpdateOnboardingStatus(cmd) => {
                Ok(vec![OrganizationEvent::OnboardingStatusUpdated(
                    OnboardingStatusUpdated {
                        status: cmd.status,
                        comments: cmd.comments.clone(),
                        caused_by_contract_id: cmd.caused_by_contract_id,
                        updated_by: cmd.base.user_id,
                    },
                )])
            }
            OrganizationCommand::RefreshArr(_) => {
                Ok(vec![OrganizationEvent::ArrRefreshed(ArrRefreshed {})])
            }
            OrganizationCommand::RefreshRenewalSummary(_) => Ok(vec![
                OrganizationEvent::RenewalSummaryRefreshed(RenewalSummaryRefreshed {}),
            ]),
        }
    }
}

impl Organization {
    fn ensure_target(&self, base: &BaseCommand) -> Result<(), DomainError> {
        if base.entity_id != self.id {
            return Err(DomainError::invariant("organization id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrganization) -> Vec<OrganizationEvent> {
        if self.created {
            return vec![];
        }
        vec![OrganizationEvent::Created(OrganizationCreated {
            fields: cmd.fields.clone(),
            source: cmd.source.clone(),
            external_system: cmd.external_system.clone(),
        })]
    }

    fn handle_add_parent(&self, cmd: &AddParent) -> Result<Vec<OrganizationEvent>, DomainError> {
        if cmd.parent_id == self.id {
            return Err(DomainError::validation("organization cannot be its own parent"));
        }
        if self.parents.get(&cmd.parent_id) == Some(&cmd.relation_type) {
            return Ok(vec![]);
        }
        Ok(vec![OrganizationEvent::ParentAdded(ParentAdded {
            parent_id: cmd.parent_id,
            relation_type: cmd.relation_type.clone(),
        })])
    }

    fn handle_remove_parent(&self, cmd: &RemoveParent) -> Vec<OrganizationEvent> {
        if !self.parents.contains_key(&cmd.parent_id) {
            return vec![];
        }
        vec![OrganizationEvent::ParentRemoved(ParentRemoved {
            parent_id: cmd.parent_id,
        })]
    }

    fn apply_update(&mut self, e: &OrganizationUpdated) {
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
            // External writers may only populate empty fields.
            fill_if_empty(&mut current.name, &incoming.name, mask.includes(OrganizationField::Name));
            fill_if_empty(
                &mut current.description,
                &incoming.description,
                mask.includes(OrganizationField::Description),
            );
            fill_if_empty(&mut current.website, &incoming.website, mask.includes(OrganizationField::Website));
            fill_if_empty(&mut current.industry, &incoming.industry, mask.includes(OrganizationField::Industry));
            if mask.includes(OrganizationField::Employees) && current.employees == 0 {
                current.employees = incoming.employees;
            }
            if mask.includes(OrganizationField::Relationship) && current.relationship.is_none() {
                current.relationship = incoming.relationship;
            }
            if mask.includes(OrganizationField::Stage) && current.stage.is_none() {
                current.stage = incoming.stage;
            }
            return;
        }

        if mask.includes(OrganizationField::Name) {
            current.name = incoming.name.clone();
        }
        if mask.includes(OrganizationField::Description) {
            current.description = incoming.description.clone();
        }
        if mask.includes(OrganizationField::Website) {
            current.website = incoming.website.clone();
        }
        if mask.includes(OrganizationField::Industry) {
            current.industry = incoming.industry.clone();
        }
        if mask.includes(OrganizationField::Employees) {
            current.employees = incoming.employees;
        }
        if mask.includes(OrganizationField::Relationship) {
            current.relationship = incoming.relationship;
        }
        if mask.includes(OrganizationField::Stage) {
            current.stage = incoming.stage;
        }
        if mask.includes(OrganizationField::Hide) {
            current.hide = incoming.hide;
        }
    }
}

fn fill_if_empty(current: &mut String, incoming: &str, included: bool) {
    if included && current.is_empty() {
        *current = incoming.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::TenantId;

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn base(id: EntityId) -> BaseCommand {
        BaseCommand::new(tenant(), id, "web")
    }

    fn created(id: EntityId, name: &str, source: &str) -> Organization {
        let mut org = Organization::empty(id);
        let events = org
            .handle(&OrganizationCommand::Create(CreateOrganization {
                base: base(id),
                fields: OrganizationFields {
                    name: name.to_string(),
                    ..Default::default()
                },
                source: SourceFields::new(source, "web"),
                external_system: ExternalSystem::default(),
            }))
            .unwrap();
        for e in &events {
            org.apply(e);
        }
        org
    }

    fn update(org: &Organization, fields: OrganizationFields, mask: FieldMask<OrganizationField>, source: &str) -> Vec<OrganizationEvent> {
        org.handle(&OrganizationCommand::Update(UpdateOrganization {
            base: base(*org.id()),
            fields,
            mask,
            source: SourceFields::new(source, "sync"),
            external_system: ExternalSystem::default(),
        }))
        .unwrap()
    }

    #[test]
    fn create_on_existing_organization_is_a_no_op() {
        let id = EntityId::new();
        let org = created(id, "Acme", "openline");

        let events = org
            .handle(&OrganizationCommand::Create(CreateOrganization {
                base: base(id),
                fields: OrganizationFields::default(),
                source: SourceFields::default(),
                external_system: ExternalSystem::default(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn update_before_create_materializes_the_organization() {
        let mut org = Organization::empty(EntityId::new());
        let events = update(
            &org,
            OrganizationFields {
                website: "acme.io".into(),
                ..Default::default()
            },
            FieldMask::only([OrganizationField::Website]),
            "openline",
        );
        org.apply(&events[0]);

        assert!(org.is_created());
        assert_eq!(org.fields().website, "acme.io");
        assert_eq!(org.version(), 1);
    }

    #[test]
    fn external_update_only_fills_empty_fields_under_internal_truth() {
        let mut org = created(EntityId::new(), "Acme", "openline");
        let events = update(
            &org,
            OrganizationFields {
                name: "ACME Corp (hubspot)".into(),
                industry: "Software".into(),
                ..Default::default()
            },
            FieldMask::all(),
            "hubspot",
        );
        org.apply(&events[0]);

        assert_eq!(org.fields().name, "Acme");
        assert_eq!(org.fields().industry, "Software");
        assert_eq!(org.source_of_truth(), SOURCE_OPENLINE);
    }

    #[test]
    fn external_update_fills_unset_counts_and_classifications() {
        let mut org = created(EntityId::new(), "Acme", "openline");
        let events = update(
            &org,
            OrganizationFields {
                employees: 250,
                relationship: Some(Relationship::Customer),
                stage: Some(Stage::Lead),
                hide: true,
                ..Default::default()
            },
            FieldMask::all(),
            "hubspot",
        );
        org.apply(&events[0]);

        assert_eq!(org.fields().employees, 250);
        assert_eq!(org.fields().relationship, Some(Relationship::Customer));
        assert_eq!(org.fields().stage, Some(Stage::Lead));
        assert!(!org.fields().hide);

        let events = update(
            &org,
            OrganizationFields {
                employees: 300,
                relationship: Some(Relationship::Prospect),
                ..Default::default()
            },
            FieldMask::all(),
            "hubspot",
        );
        org.apply(&events[0]);
        assert_eq!(org.fields().employees, 250);
        assert_eq!(org.fields().relationship, Some(Relationship::Customer));
    }

    #[test]
    fn internal_update_honours_the_mask() {
        let mut org = created(EntityId::new(), "Acme", "openline");
        let events = update(
            &org,
            OrganizationFields {
                name: String::new(),
                relationship: Some(Relationship::Customer),
                ..Default::default()
            },
            FieldMask::only([OrganizationField::Relationship]),
            "openline",
        );
        org.apply(&events[0]);

        assert_eq!(org.fields().name, "Acme");
        assert_eq!(org.fields().relationship, Some(Relationship::Customer));
    }

    #[test]
    fn add_parent_rejects_self_and_is_idempotent() {
        let id = EntityId::new();
        let mut org = created(id, "Acme", "openline");

        let err = org
            .handle(&OrganizationCommand::AddParent(AddParent {
                base: base(id),
                parent_id: id,
                relation_type: "subsidiary".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let parent = EntityId::new();
        let cmd = OrganizationCommand::AddParent(AddParent {
            base: base(id),
            parent_id: parent,
            relation_type: "subsidiary".into(),
        });
        let events = org.handle(&cmd).unwrap();
        org.apply(&events[0]);
        assert!(org.handle(&cmd).unwrap().is_empty());
        assert_eq!(org.parents().get(&parent).map(String::as_str), Some("subsidiary"));
    }

    #[test]
    fn refresh_events_bump_version_without_state_change() {
        let mut org = created(EntityId::new(), "Acme", "openline");
        let before = org.fields().clone();
        let events = org
            .handle(&OrganizationCommand::RefreshArr(RefreshArr { base: base(*org.id()) }))
            .unwrap();
        org.apply(&events[0]);
        org.skip_internal();

        assert_eq!(org.version(), 3);
        assert_eq!(org.fields(), &before);
    }

    #[test]
    fn handle_rejects_commands_for_another_organization() {
        let org = created(EntityId::new(), "Acme", "openline");
        let cmd = OrganizationCommand::RefreshArr(RefreshArr {
            base: base(EntityId::new()),
        });
        assert!(matches!(org.handle(&cmd).unwrap_err(), DomainError::InvariantViolation(_)));
    }
}
