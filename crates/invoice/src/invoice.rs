use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{Aggregate, AggregateRoot, DomainError, EntityId, FieldMask, SourceFields};
use custos_events::{BaseCommand, Command, impl_event_codec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Initialized,
    Draft,
    Due,
    Paid,
    Void,
    Overdue,
    Empty,
}

impl InvoiceStatus {
    /// Timeline message for an invoice entering this status.
    pub fn action_message(self, number: &str, currency: &str, total: f64) -> Option<String> {
        match self {
            InvoiceStatus::Due => Some(format!(
                "Invoice N° {number} issued with an amount of {currency} {total:.2}"
            )),
            InvoiceStatus::Paid => Some(format!("Invoice N° {number} paid in full: {currency} {total:.2}")),
            InvoiceStatus::Void => Some(format!("Invoice N° {number} voided")),
            InvoiceStatus::Overdue => Some(format!("Invoice N° {number} overdue")),
            InvoiceStatus::Initialized | InvoiceStatus::Draft | InvoiceStatus::Empty => None,
        }
    }
}

/// One billed line. Ids are assigned when the invoice is filled so that replays and
/// redeliveries of the fill write the same lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: EntityId,
    pub name: String,
    pub price: f64,
    pub quantity: i64,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    #[serde(default)]
    pub service_line_item_id: Option<EntityId>,
    #[serde(default)]
    pub billed_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceField {
    Status,
    PaymentLink,
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    id: EntityId,
    contract_id: Option<EntityId>,
    number: String,
    currency: String,
    status: InvoiceStatus,
    total_amount: f64,
    payment_link: String,
    lines: Vec<InvoiceLine>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Invoice {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            contract_id: None,
            number: String::new(),
            currency: String::new(),
            status: InvoiceStatus::Initialized,
            total_amount: 0.0,
            payment_link: String::new(),
            lines: Vec::new(),
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn contract_id(&self) -> Option<EntityId> {
        self.contract_id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn payment_link(&self) -> &str {
        &self.payment_link
    }

    pub fn lines(&self) -> &[InvoiceLine] {
        &self.lines
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl AggregateRoot for Invoice {
    type Id = EntityId;
    const AGGREGATE_TYPE: &'static str = "invoice";

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInvoiceForContract {
    pub base: BaseCommand,
    pub contract_id: EntityId,
    pub currency: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub source: SourceFields,
}

/// Line input for a fill. Ids are assigned by the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillLine {
    pub name: String,
    pub price: f64,
    pub quantity: i64,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    pub service_line_item_id: Option<EntityId>,
    pub billed_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillInvoice {
    pub base: BaseCommand,
    pub number: String,
    pub status: InvoiceStatus,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    pub note: String,
    pub lines: Vec<FillLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInvoice {
    pub base: BaseCommand,
    pub status: InvoiceStatus,
    pub payment_link: String,
    pub mask: FieldMask<InvoiceField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidInvoice {
    pub base: BaseCommand,
}

/// Permanently removes a draft invoice that was never filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteInvoice {
    pub base: BaseCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateForContract(CreateInvoiceForContract),
    Fill(FillInvoice),
    Update(UpdateInvoice),
    Void(VoidInvoice),
    Delete(DeleteInvoice),
}

impl Command for InvoiceCommand {
    fn base(&self) -> &BaseCommand {
        match self {
            InvoiceCommand::CreateForContract(c) => &c.base,
            InvoiceCommand::Fill(c) => &c.base,
            InvoiceCommand::Update(c) => &c.base,
            InvoiceCommand::Void(c) => &c.base,
            InvoiceCommand::Delete(c) => &c.base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub contract_id: EntityId,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    pub source: SourceFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFilled {
    pub number: String,
    pub status: InvoiceStatus,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    #[serde(default)]
    pub note: String,
    pub lines: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceUpdated {
    pub status: InvoiceStatus,
    #[serde(default)]
    pub payment_link: String,
    #[serde(default)]
    pub mask: FieldMask<InvoiceField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceVoided {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDeleted {}

#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceEvent {
    Created(InvoiceCreated),
    Filled(InvoiceFilled),
    Updated(InvoiceUpdated),
    Voided(InvoiceVoided),
    Deleted(InvoiceDeleted),
}

impl_event_codec!(InvoiceEvent {
    Created => "invoice.created",
    Filled => "invoice.filled",
    Updated => "invoice.updated",
    Voided => "invoice.voided",
    Deleted => "invoice.deleted",
});

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::Created(e) => {
                self.contract_id = Some(e.contract_id);
                self.currency = e.currency.clone();
                self.status = InvoiceStatus::Initialized;
                self.created = true;
            }
            InvoiceEvent::Filled(e) => {
                self.number = e.number.clone();
                self.status = e.status;
                self.total_amount = e.total_amount;
                self.lines = e.lines.clone();
            }
            InvoiceEvent::Updated(e) => {
                if e.mask.includes(InvoiceField::Status) {
                    self.status = e.status;
                }
                if e.mask.includes(InvoiceField::PaymentLink) {
                    self.payment_link = e.payment_link.clone();
                }
            }
            InvoiceEvent::Voided(_) => self.status = InvoiceStatus::Void,
            InvoiceEvent::Deleted(_) => self.deleted = true,
        }
        self.version += 1;
    }

    fn skip_internal(&mut self) {
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.base().entity_id != self.id {
            return Err(DomainError::invariant("invoice id mismatch"));
        }
        if let InvoiceCommand::CreateForContract(cmd) = command {
            if self.created {
                return Ok(vec![]);
            }
            return Ok(vec![InvoiceEvent::Created(InvoiceCreated {
                contract_id: cmd.contract_id,
                currency: cmd.currency.clone(),
                period_start: cmd.period_start,
                period_end: cmd.period_end,
                dry_run: cmd.dry_run,
                source: cmd.source.clone(),
            })]);
        }

        if !self.created || self.deleted {
            return Err(DomainError::missing(Self::AGGREGATE_TYPE, self.id));
        }
        match command {
            InvoiceCommand::CreateForContract(_) => Ok(vec![]),
            InvoiceCommand::Fill(cmd) => Ok(vec![InvoiceEvent::Filled(self.fill(cmd))]),
            InvoiceCommand::Update(cmd) => Ok(vec![InvoiceEvent::Updated(InvoiceUpdated {
                status: cmd.status,
                payment_link: cmd.payment_link.clone(),
                mask: cmd.mask.clone(),
            })]),
            InvoiceCommand::Void(_) => {
                if self.status == InvoiceStatus::Void {
                    return Ok(vec![]);
                }
                Ok(vec![InvoiceEvent::Voided(InvoiceVoided {})])
            }
            InvoiceCommand::Delete(_) => {
                if !matches!(self.status, InvoiceStatus::Initialized | InvoiceStatus::Draft) {
                    return Err(DomainError::validation("invoice status is not draft"));
                }
                if !self.lines.is_empty() {
                    return Err(DomainError::validation("invoice has invoice lines"));
                }
                Ok(vec![InvoiceEvent::Deleted(InvoiceDeleted {})])
            }
        }
    }
}

impl Invoice {
    fn fill(&self, cmd: &FillInvoice) -> InvoiceFilled {
        // An already numbered invoice keeps its number.
        let number = if self.number.is_empty() {
            cmd.number.clone()
        } else {
            self.number.clone()
        };
        let lines = cmd
            .lines
            .iter()
            .map(|line| InvoiceLine {
                id: EntityId::new(),
                name: line.name.clone(),
                price: line.price,
                quantity: line.quantity,
                amount: line.amount,
                vat: line.vat,
                total_amount: line.total_amount,
                service_line_item_id: line.service_line_item_id,
                billed_type: line.billed_type.clone(),
            })
            .collect();
        InvoiceFilled {
            number,
            status: cmd.status,
            amount: cmd.amount,
            vat: cmd.vat,
            total_amount: cmd.total_amount,
            note: cmd.note.clone(),
            lines,
        }
    }
}
