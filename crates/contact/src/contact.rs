use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{
    Aggregate, AggregateRoot, DomainError, EntityId, ExternalSystem, FieldMask, SOURCE_OPENLINE, SourceFields,
};
use custos_events::{BaseCommand, Command, impl_event_codec};

/// Writable profile fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactFields {
    pub first_name: String,
    pub last_name: String,
    pub name: String,
    pub prefix: String,
    pub description: String,
    pub timezone: String,
    pub profile_photo_url: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactField {
    FirstName,
    LastName,
    Name,
    Prefix,
    Description,
    Timezone,
    ProfilePhotoUrl,
    Username,
}

impl ContactFields {
    fn get_mut(&mut self, field: ContactField) -> &mut String {
        match field {
            ContactField::FirstName => &mut self.first_name,
            ContactField::LastName => &mut self.last_name,
            ContactField::Name => &mut self.name,
            ContactField::Prefix => &mut self.prefix,
            ContactField::Description => &mut self.description,
            ContactField::Timezone => &mut self.timezone,
            ContactField::ProfilePhotoUrl => &mut self.profile_photo_url,
            ContactField::Username => &mut self.username,
        }
    }

    pub fn get(&self, field: ContactField) -> &str {
        match field {
            ContactField::FirstName => &self.first_name,
            ContactField::LastName => &self.last_name,
            ContactField::Name => &self.name,
            ContactField::Prefix => &self.prefix,
            ContactField::Description => &self.description,
            ContactField::Timezone => &self.timezone,
            ContactField::ProfilePhotoUrl => &self.profile_photo_url,
            ContactField::Username => &self.username,
        }
    }
}

impl ContactField {
    pub const ALL: [ContactField; 8] = [
        ContactField::FirstName,
        ContactField::LastName,
        ContactField::Name,
        ContactField::Prefix,
        ContactField::Description,
        ContactField::Timezone,
        ContactField::ProfilePhotoUrl,
        ContactField::Username,
    ];
}

/// A contact's position at an organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRole {
    pub job_title: String,
    pub description: String,
    pub primary: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Aggregate root: Contact.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    id: EntityId,
    fields: ContactFields,
    source_of_truth: String,
    job_roles: BTreeMap<EntityId, JobRole>,
    version: u64,
    created: bool,
}

impl Contact {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            fields: ContactFields::default(),
            source_of_truth: String::new(),
            job_roles: BTreeMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn fields(&self) -> &ContactFields {
        &self.fields
    }

    pub fn source_of_truth(&self) -> &str {
        &self.source_of_truth
    }

    /// Job roles keyed by organization.
    pub fn job_roles(&self) -> &BTreeMap<EntityId, JobRole> {
        &self.job_roles
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Contact {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "contact";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateContact. A no-op when the contact already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContact {
    pub base: BaseCommand,
    pub fields: ContactFields,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateContact {
    pub base: BaseCommand,
    pub fields: ContactFields,
    pub mask: FieldMask<ContactField>,
    pub source: SourceFields,
    pub external_system: ExternalSystem,
}

/// Command: LinkOrganization. Records the contact's job role at an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkOrganization {
    pub base: BaseCommand,
    pub organization_id: EntityId,
    pub job_role: JobRole,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContactCommand {
    Create(CreateContact),
    Update(UpdateContact),
    LinkOrganization(LinkOrganization),
}

impl Command for ContactCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            ContactCommand::Create(c) => &c.base,
            ContactCommand::Update(c) => &c.base,
            ContactCommand::LinkOrganization(c) => &c.base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCreated {
    pub fields: ContactFields,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactUpdated {
    pub fields: ContactFields,
    #[serde(default)]
    pub mask: FieldMask<ContactField>,
    pub source: SourceFields,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationLinked {
    pub organization_id: EntityId,
    #[serde(default)]
    pub job_role: JobRole,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContactEvent {
    Created(ContactCreated),
    Updated(ContactUpdated),
    OrganizationLinked(OrganizationLinked),
}

impl_event_codec!(ContactEvent {
    Created => "contact.created",
    Updated => "contact.updated",
    OrganizationLinked => "contact.organization_linked",
});

impl Aggregate for Contact {
    type Command = ContactCommand;
    type Event = ContactEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ContactEvent::Created(e) => {
                self.fields = e.fields.clone();
                self.source_of_truth = e.source.source_of_truth.clone();
                self.created = true;
            }
            ContactEvent::Updated(e) => {
                self.apply_update(e);
                self.created = true;
            }
            ContactEvent::OrganizationLinked(e) => {
                self.job_roles.insert(e.organization_id, e.job_role.clone());
            }
        }
        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.base().entity_id != self.id {
            return Err(DomainError::invariant("contact id mismatch"));
        }
        match command {
            ContactCommand::Create(_) if self.created => Ok(vec![]),
            ContactCommand::Create(cmd) => Ok(vec![ContactEvent::Created(ContactCreated {
                fields: cmd.fields.clone(),
                source: cmd.source.clone(),
                external_system: cmd.external_system.clone(),
            })]),
            ContactCommand::Update(cmd) => Ok(vec![ContactEvent::Updated(ContactUpdated {
                fields: cmd.fields.clone(),
                mask: cmd.mask.clone(),
                source: cmd.source.clone(),
                external_system: cmd.external_system.clone(),
            })]),
            ContactCommand::LinkOrganization(cmd) => self.handle_link(cmd),
        }
    }
}

impl Contact {
    fn handle_link(&self, cmd: &LinkOrganization) -> Result<Vec<ContactEvent>, DomainError> {
        let role = &cmd.job_role;
        if let (Some(started), Some(ended)) = (role.started_at, role.ended_at) {
            if ended < started {
                return Err(DomainError::validation("job role cannot end before it starts"));
            }
        }
        if self.job_roles.get(&cmd.organization_id) == Some(role) {
            return Ok(vec![]);
        }
        Ok(vec![ContactEvent::OrganizationLinked(OrganizationLinked {
            organization_id: cmd.organization_id,
            job_role: role.clone(),
            source: cmd.source.clone(),
        })])
    }

    fn apply_update(&mut self, e: &ContactUpdated) {
        let fill_only = SourceFields::fill_only(&self.source_of_truth, &e.source);
        if e.source.source == SOURCE_OPENLINE {
            self.source_of_truth = SOURCE_OPENLINE.to_string();
        } else if self.source_of_truth.is_empty() {
            self.source_of_truth = e.source.source_of_truth.clone();
        }

        for field in ContactField::ALL {
            if !e.mask.includes(field) {
                continue;
            }
            let current = self.fields.get_mut(field);
            // External writers may only populate empty fields.
            if !fill_only || current.is_empty() {
                *current = e.fields.get(field).to_string();
            }
        }
    }
}
