use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{Aggregate, AggregateRoot, DomainError, EntityId, SourceFields};
use custos_events::{BaseCommand, Command, impl_event_codec};

/// How a line item is billed. Only the recurring kinds contribute to ARR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BilledType {
    #[default]
    None,
    Monthly,
    Quarterly,
    Annually,
    Once,
    Usage,
}

impl BilledType {
    /// Multiplier turning one billing period into a year.
    pub fn periods_per_year(self) -> f64 {
        match self {
            BilledType::Annually => 1.0,
            BilledType::Monthly => 12.0,
            BilledType::Quarterly => 4.0,
            BilledType::None | BilledType::Once | BilledType::Usage => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLineItemFields {
    pub name: String,
    pub billed: BilledType,
    pub price: f64,
    pub quantity: i64,
    pub comments: String,
}

/// Aggregate root: ServiceLineItem (a priced line on a contract).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLineItem {
    id: EntityId,
    contract_id: Option<EntityId>,
    fields: ServiceLineItemFields,
    ended_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl ServiceLineItem {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            contract_id: None,
            fields: ServiceLineItemFields::default(),
            ended_at: None,
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn contract_id(&self) -> Option<EntityId> {
        self.contract_id
    }

    pub fn fields(&self) -> &ServiceLineItemFields {
        &self.fields
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl AggregateRoot for ServiceLineItem {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "service_line_item";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceLineItem {
    pub base: BaseCommand,
    pub contract_id: EntityId,
    /// First item of a versioned line, if this is a price/quantity change.
    pub parent_id: Option<EntityId>,
    pub fields: ServiceLineItemFields,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateServiceLineItem {
    pub base: BaseCommand,
    pub fields: ServiceLineItemFields,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseServiceLineItem {
    pub base: BaseCommand,
    pub ended_at: DateTime<Utc>,
    pub canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteServiceLineItem {
    pub base: BaseCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceLineItemCommand {
    Create(CreateServiceLineItem),
    Update(UpdateServiceLineItem),
    Close(CloseServiceLineItem),
    Delete(DeleteServiceLineItem),
}

impl Command for ServiceLineItemCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            ServiceLineItemCommand::Create(c) => &c.base,
            ServiceLineItemCommand::Update(c) => &c.base,
            ServiceLineItemCommand::Close(c) => &c.base,
            ServiceLineItemCommand::Delete(c) => &c.base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLineItemCreated {
    pub contract_id: EntityId,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    pub fields: ServiceLineItemFields,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLineItemUpdated {
    /// Carried so the projector can re-link items whose create was missed.
    #[serde(default)]
    pub contract_id: Option<EntityId>,
    pub fields: ServiceLineItemFields,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLineItemClosed {
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLineItemDeleted {}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceLineItemEvent {
    Created(ServiceLineItemCreated),
    Updated(ServiceLineItemUpdated),
    Closed(ServiceLineItemClosed),
    Deleted(ServiceLineItemDeleted),
}

impl_event_codec!(ServiceLineItemEvent {
    Created => "service_line_item.created",
    Updated => "service_line_item.updated",
    Closed => "service_line_item.closed",
    Deleted => "service_line_item.deleted",
});

impl Aggregate for ServiceLineItem {
    type Command = ServiceLineItemCommand;
    type Event = ServiceLineItemEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ServiceLineItemEvent::Created(e) => {
                self.contract_id = Some(e.contract_id);
                self.fields = e.fields.clone();
                self.ended_at = e.ended_at;
                self.created = true;
            }
            ServiceLineItemEvent::Updated(e) => {
                self.fields = e.fields.clone();
                self.created = true;
            }
            ServiceLineItemEvent::Closed(e) => self.ended_at = Some(e.ended_at),
            ServiceLineItemEvent::Deleted(_) => self.deleted = true,
        }
        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.base().entity_id != self.id {
            return Err(DomainError::invariant("service line item id mismatch"));
        }
        match command {
            ServiceLineItemCommand::Create(cmd) => {
                if self.created {
                    return Ok(vec![]);
                }
                validate(&cmd.fields)?;
                Ok(vec![ServiceLineItemEvent::Created(ServiceLineItemCreated {
                    contract_id: cmd.contract_id,
                    parent_id: cmd.parent_id,
                    fields: cmd.fields.clone(),
                    started_at: cmd.started_at,
                    ended_at: cmd.ended_at,
                    source: cmd.source.clone(),
                })])
            }
            ServiceLineItemCommand::Update(cmd) => {
                if self.deleted {
                    return Err(DomainError::validation("service line item is deleted"));
                }
                validate(&cmd.fields)?;
                Ok(vec![ServiceLineItemEvent::Updated(ServiceLineItemUpdated {
                    contract_id: self.contract_id,
                    fields: cmd.fields.clone(),
                    source: cmd.source.clone(),
                })])
            }
            ServiceLineItemCommand::Close(cmd) => {
                if !self.created {
                    return Err(DomainError::missing(Self::AGGREGATE_TYPE, self.id));
                }
                if self.ended_at.is_some() {
                    return Ok(vec![]);
                }
                Ok(vec![ServiceLineItemEvent::Closed(ServiceLineItemClosed {
                    ended_at: cmd.ended_at,
                    canceled: cmd.canceled,
                })])
            }
            ServiceLineItemCommand::Delete(_) => {
                if self.deleted {
                    return Ok(vec![]);
                }
                Ok(vec![ServiceLineItemEvent::Deleted(ServiceLineItemDeleted {})])
            }
        }
    }
}

fn validate(fields: &ServiceLineItemFields) -> Result<(), DomainError> {
    if fields.price < 0.0 {
        return Err(DomainError::validation("price cannot be negative"));
    }
    if fields.quantity < 0 {
        return Err(DomainError::validation("quantity cannot be negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::TenantId;

    fn base(id: EntityId) -> BaseCommand {
        BaseCommand::new(TenantId::new("acme"), id, "web")
    }

    fn created() -> ServiceLineItem {
        let id = EntityId::new();
        let mut item = ServiceLineItem::empty(id);
        let events = item
            .handle(&ServiceLineItemCommand::Create(CreateServiceLineItem {
                base: base(id),
                contract_id: EntityId::new(),
                parent_id: None,
                fields: ServiceLineItemFields {
                    name: "Seats".into(),
                    billed: BilledType::Monthly,
                    price: 10.0,
                    quantity: 5,
                    comments: String::new(),
                },
                started_at: None,
                ended_at: None,
                source: SourceFields::default(),
            }))
            .unwrap();
        item.apply(&events[0]);
        item
    }

    #[test]
    fn only_recurring_billing_counts_towards_a_year() {
        assert_eq!(BilledType::Monthly.periods_per_year(), 12.0);
        assert_eq!(BilledType::Quarterly.periods_per_year(), 4.0);
        assert_eq!(BilledType::Annually.periods_per_year(), 1.0);
        assert_eq!(BilledType::Usage.periods_per_year(), 0.0);
    }

    #[test]
    fn update_carries_the_owning_contract() {
        let item = created();
        let events = item
            .handle(&ServiceLineItemCommand::Update(UpdateServiceLineItem {
                base: base(*item.id()),
                fields: ServiceLineItemFields {
                    quantity: 8,
                    ..item.fields().clone()
                },
                source: SourceFields::default(),
            }))
            .unwrap();
        let ServiceLineItemEvent::Updated(updated) = &events[0] else {
            panic!("expected update event");
        };
        assert_eq!(updated.contract_id, item.contract_id());
    }

    #[test]
    fn negative_quantity_is_rejected() {
        let item = created();
        let err = item
            .handle(&ServiceLineItemCommand::Update(UpdateServiceLineItem {
                base: base(*item.id()),
                fields: ServiceLineItemFields {
                    quantity: -1,
                    ..Default::default()
                },
                source: SourceFields::default(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn closing_twice_is_a_no_op() {
        let mut item = created();
        let close = ServiceLineItemCommand::Close(CloseServiceLineItem {
            base: base(*item.id()),
            ended_at: Utc::now(),
            canceled: false,
        });
        let events = item.handle(&close).unwrap();
        item.apply(&events[0]);

        assert!(item.ended_at().is_some());
        assert!(item.handle(&close).unwrap().is_empty());
        assert_eq!(item.version(), 2);
    }
}
