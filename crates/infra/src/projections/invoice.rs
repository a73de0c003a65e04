use std::sync::Arc;

use serde_json::{Map, Value, json};

use custos_events::{EventEnvelope, RecordedEvent};
use custos_invoice::{InvoiceEvent, InvoiceField, InvoiceLine, InvoiceStatus};

use crate::read_model::{
    ActionEntry, EntityMerge, InvoiceView, NodeRef, ReadModelStore, RelatedItem, Relation, labels, queries, relations,
};

use super::{EventHandler, ProjectionError, decode, to_value};

fn status_action(status: InvoiceStatus) -> &'static str {
    match status {
        InvoiceStatus::Due => "INVOICE_ISSUED",
        InvoiceStatus::Paid => "INVOICE_PAID",
        InvoiceStatus::Void => "INVOICE_VOIDED",
        InvoiceStatus::Overdue => "INVOICE_OVERDUE",
        _ => "INVOICE_STATUS_CHANGED",
    }
}

fn line_item(line: &InvoiceLine) -> Result<RelatedItem, ProjectionError> {
    let mut fields = match to_value(line)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    fields.remove("id");
    Ok(RelatedItem {
        label: labels::INVOICE_LINE.to_string(),
        id: line.id,
        fields,
    })
}

/// Projects invoices and their lines.
pub struct InvoiceProjector {
    read_model: Arc<dyn ReadModelStore>,
}

impl InvoiceProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>) -> Self {
        Self { read_model }
    }

    pub fn event_types() -> &'static [&'static str] {
        InvoiceEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    /// Timeline entry for an invoice that just entered `status`.
    fn record_status(&self, env: &EventEnvelope<InvoiceEvent>, status: InvoiceStatus) -> Result<(), ProjectionError> {
        let tenant = &env.metadata().tenant;
        let Some(invoice) = queries::load::<InvoiceView>(self.store(), tenant, labels::INVOICE, env.entity_id())? else {
            return Ok(());
        };
        let invoice = invoice.view;
        if invoice.dry_run {
            return Ok(());
        }
        let Some(content) = status.action_message(&invoice.number, &invoice.currency, invoice.total_amount) else {
            return Ok(());
        };
        self.store().append_action(
            tenant,
            ActionEntry {
                id: env.event_id(),
                entity: NodeRef::new(labels::INVOICE, env.entity_id()),
                action_type: status_action(status).to_string(),
                content,
                metadata: json!({
                    "status": status,
                    "number": invoice.number,
                    "currency": invoice.currency,
                    "total_amount": invoice.total_amount,
                }),
                app_source: env.metadata().app_source.clone(),
                created_at: env.metadata().created_at,
            },
        )?;
        Ok(())
    }
}

impl EventHandler for InvoiceProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<InvoiceEvent>(event)? else {
            return Ok(());
        };
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::INVOICE, id);

        match env.payload() {
            InvoiceEvent::Created(e) => {
                let merge = EntityMerge::from_source(labels::INVOICE, id, &e.source)
                    .always("contract_id", json!(e.contract_id))
                    .sourced("currency", json!(e.currency))
                    .sourced("period_start", json!(e.period_start))
                    .sourced("period_end", json!(e.period_end))
                    .sourced("dry_run", json!(e.dry_run))
                    .on_create("status", to_value(&InvoiceStatus::Initialized)?);
                self.store().merge(tenant, merge)?;
                self.store().relate(
                    tenant,
                    Relation::new(NodeRef::new(labels::CONTRACT, e.contract_id), relations::HAS_INVOICE, node),
                )?;
            }
            InvoiceEvent::Filled(e) => {
                let merge = EntityMerge::new(labels::INVOICE, id)
                    .always("number", json!(e.number))
                    .always("status", to_value(&e.status)?)
                    .always("amount", json!(e.amount))
                    .always("vat", json!(e.vat))
                    .always("total_amount", json!(e.total_amount))
                    .always("note", json!(e.note));
                let outcome = self.store().merge(tenant, merge)?;
                let lines = e.lines.iter().map(line_item).collect::<Result<Vec<_>, _>>()?;
                self.store().replace_related(tenant, &node, relations::HAS_LINE, lines)?;
                if outcome.changed("status") {
                    self.record_status(&env, e.status)?;
                }
            }
            InvoiceEvent::Updated(e) => {
                let merge = EntityMerge::new(labels::INVOICE, id)
                    .always_if(e.mask.includes(InvoiceField::Status), "status", to_value(&e.status)?)
                    .always_if(e.mask.includes(InvoiceField::PaymentLink), "payment_link", json!(e.payment_link));
                let outcome = self.store().merge(tenant, merge)?;
                if outcome.changed("status") {
                    self.record_status(&env, e.status)?;
                }
            }
            InvoiceEvent::Voided(_) => {
                self.store().merge(
                    tenant,
                    EntityMerge::new(labels::INVOICE, id).always("status", to_value(&InvoiceStatus::Void)?),
                )?;
                self.record_status(&env, InvoiceStatus::Void)?;
            }
            InvoiceEvent::Deleted(_) => {
                self.store().replace_related(tenant, &node, relations::HAS_LINE, Vec::new())?;
                self.store().delete(tenant, &node)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use custos_core::{EntityId, FieldMask, SourceFields};
    use custos_invoice::{InvoiceCreated, InvoiceDeleted, InvoiceFilled, InvoiceUpdated, InvoiceVoided};

    use super::*;
    use crate::projections::testing::{recorded, tenant};
    use crate::read_model::{InMemoryReadModel, InvoiceLineView};

    fn line(name: &str, total: f64) -> InvoiceLine {
        InvoiceLine {
            id: EntityId::new(),
            name: name.into(),
            price: total,
            quantity: 1,
            amount: total,
            vat: 0.0,
            total_amount: total,
            service_line_item_id: None,
            billed_type: "MONTHLY".into(),
        }
    }

    fn created(contract_id: EntityId) -> InvoiceEvent {
        InvoiceEvent::Created(InvoiceCreated {
            contract_id,
            currency: "EUR".into(),
            period_start: Some(Utc::now()),
            period_end: None,
            dry_run: false,
            source: SourceFields::openline("billing"),
        })
    }

    fn filled(lines: Vec<InvoiceLine>) -> InvoiceEvent {
        let total = lines.iter().map(|l| l.total_amount).sum();
        InvoiceEvent::Filled(InvoiceFilled {
            number: "INV-001".into(),
            status: InvoiceStatus::Due,
            amount: total,
            vat: 0.0,
            total_amount: total,
            note: String::new(),
            lines,
        })
    }

    fn setup() -> (Arc<InMemoryReadModel>, InvoiceProjector, EntityId, EntityId) {
        let store = Arc::new(InMemoryReadModel::new());
        let projector = InvoiceProjector::new(store.clone());
        let contract = EntityId::new();
        let invoice = EntityId::new();
        projector.handle(&recorded("invoice", invoice, 1, created(contract))).unwrap();
        (store, projector, contract, invoice)
    }

    fn stored(store: &InMemoryReadModel, id: EntityId) -> InvoiceView {
        queries::load::<InvoiceView>(store, &tenant(), labels::INVOICE, id).unwrap().unwrap().view
    }

    #[test]
    fn created_invoices_hang_off_their_contract() {
        let (store, _, contract, invoice) = setup();
        let related = store
            .related(&tenant(), &NodeRef::new(labels::CONTRACT, contract), relations::HAS_INVOICE)
            .unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].to.id, invoice);
        assert_eq!(stored(&store, invoice).status, InvoiceStatus::Initialized);
    }

    #[test]
    fn fill_persists_every_line_once() {
        let (store, projector, _, invoice) = setup();
        let event = recorded("invoice", invoice, 2, filled(vec![line("Seats", 100.0), line("Support", 20.0)]));

        projector.handle(&event).unwrap();
        projector.handle(&event).unwrap();

        let view = stored(&store, invoice);
        assert_eq!(view.number, "INV-001");
        assert_eq!(view.total_amount, 120.0);
        let lines = store
            .related(&tenant(), &NodeRef::new(labels::INVOICE, invoice), relations::HAS_LINE)
            .unwrap();
        assert_eq!(lines.len(), 2);
        let seats = lines
            .iter()
            .filter_map(|r| queries::load::<InvoiceLineView>(store.as_ref(), &tenant(), labels::INVOICE_LINE, r.to.id).unwrap())
            .find(|l| l.view.name == "Seats")
            .unwrap();
        assert_eq!(seats.view.total_amount, 100.0);
        assert_eq!(seats.view.billed_type, "MONTHLY");

        let actions = store.actions_for(&tenant(), &NodeRef::new(labels::INVOICE, invoice)).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].content, "Invoice N° INV-001 issued with an amount of EUR 120.00");
    }

    #[test]
    fn masked_update_leaves_the_status_alone() {
        let (store, projector, _, invoice) = setup();
        projector
            .handle(&recorded("invoice", invoice, 2, filled(vec![line("Seats", 10.0)])))
            .unwrap();

        projector
            .handle(&recorded(
                "invoice",
                invoice,
                3,
                InvoiceEvent::Updated(InvoiceUpdated {
                    status: InvoiceStatus::Initialized,
                    payment_link: "https://pay.example/inv-001".into(),
                    mask: FieldMask::only([InvoiceField::PaymentLink]),
                }),
            ))
            .unwrap();

        let view = stored(&store, invoice);
        assert_eq!(view.status, InvoiceStatus::Due);
        assert_eq!(view.payment_link, "https://pay.example/inv-001");
    }

    #[test]
    fn voiding_records_an_action() {
        let (store, projector, _, invoice) = setup();
        projector
            .handle(&recorded("invoice", invoice, 2, filled(vec![line("Seats", 10.0)])))
            .unwrap();
        projector
            .handle(&recorded("invoice", invoice, 3, InvoiceEvent::Voided(InvoiceVoided {})))
            .unwrap();

        assert_eq!(stored(&store, invoice).status, InvoiceStatus::Void);
        let actions = store.actions_for(&tenant(), &NodeRef::new(labels::INVOICE, invoice)).unwrap();
        assert!(actions.iter().any(|a| a.action_type == "INVOICE_VOIDED"));
    }

    #[test]
    fn delete_removes_the_invoice_and_its_lines() {
        let (store, projector, _, invoice) = setup();
        let first = line("Seats", 10.0);
        let line_id = first.id;
        projector
            .handle(&recorded("invoice", invoice, 2, filled(vec![first])))
            .unwrap();
        projector
            .handle(&recorded("invoice", invoice, 3, InvoiceEvent::Deleted(InvoiceDeleted {})))
            .unwrap();

        assert!(store.get(&tenant(), &NodeRef::new(labels::INVOICE, invoice)).unwrap().is_none());
        assert!(store.get(&tenant(), &NodeRef::new(labels::INVOICE_LINE, line_id)).unwrap().is_none());
    }
}
