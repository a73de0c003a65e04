use std::sync::Arc;

use serde_json::json;

use custos_contract::{ServiceLineItemEvent, ServiceLineItemFields};
use custos_core::{EntityId, TenantId};
use custos_events::RecordedEvent;

use crate::cascade::{CascadeContext, CascadeOrchestrator};
use crate::read_model::{EntityMerge, NodeRef, ReadModelStore, Relation, ServiceLineItemView, labels, queries, relations};

use super::{EventHandler, ProjectionError, decode, to_value};

/// Projects service line items and keeps the owning contract's renewal ARR current.
pub struct ServiceLineItemProjector {
    read_model: Arc<dyn ReadModelStore>,
    cascade: Arc<CascadeOrchestrator>,
}

impl ServiceLineItemProjector {
    pub fn new(read_model: Arc<dyn ReadModelStore>, cascade: Arc<CascadeOrchestrator>) -> Self {
        Self { read_model, cascade }
    }

    pub fn event_types() -> &'static [&'static str] {
        ServiceLineItemEvent::EVENT_TYPES
    }

    fn store(&self) -> &dyn ReadModelStore {
        self.read_model.as_ref()
    }

    fn link(&self, tenant: &TenantId, contract_id: EntityId, item_id: EntityId) -> Result<(), ProjectionError> {
        self.store().relate(
            tenant,
            Relation::new(
                NodeRef::new(labels::CONTRACT, contract_id),
                relations::HAS_SERVICE,
                NodeRef::new(labels::SERVICE_LINE_ITEM, item_id),
            ),
        )?;
        Ok(())
    }

    fn stored_contract(&self, tenant: &TenantId, id: EntityId) -> Result<Option<EntityId>, ProjectionError> {
        Ok(queries::load::<ServiceLineItemView>(self.store(), tenant, labels::SERVICE_LINE_ITEM, id)?
            .and_then(|item| item.view.contract_id))
    }
}

fn item_fields(merge: EntityMerge, f: &ServiceLineItemFields) -> Result<EntityMerge, ProjectionError> {
    Ok(merge
        .sourced("name", json!(f.name))
        .sourced("billed", to_value(&f.billed)?)
        .sourced("price", json!(f.price))
        .sourced("quantity", json!(f.quantity))
        .sourced("comments", json!(f.comments)))
}

impl EventHandler for ServiceLineItemProjector {
    fn handle(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(env) = decode::<ServiceLineItemEvent>(event)? else {
            return Ok(());
        };
        let tenant = &env.metadata().tenant;
        let id = env.entity_id();
        let node = NodeRef::new(labels::SERVICE_LINE_ITEM, id);

        let contract_id = match env.payload() {
            ServiceLineItemEvent::Created(e) => {
                let merge = EntityMerge::from_source(labels::SERVICE_LINE_ITEM, id, &e.source)
                    .always("contract_id", json!(e.contract_id))
                    .on_create("parent_id", json!(e.parent_id))
                    .sourced("started_at", json!(e.started_at))
                    .sourced("ended_at", json!(e.ended_at));
                self.store().merge(tenant, item_fields(merge, &e.fields)?)?;
                self.link(tenant, e.contract_id, id)?;
                Some(e.contract_id)
            }
            ServiceLineItemEvent::Updated(e) => {
                let mut merge = EntityMerge::from_source(labels::SERVICE_LINE_ITEM, id, &e.source);
                if let Some(contract_id) = e.contract_id {
                    merge = merge.always("contract_id", json!(contract_id));
                }
                self.store().merge(tenant, item_fields(merge, &e.fields)?)?;
                if let Some(contract_id) = e.contract_id {
                    self.link(tenant, contract_id, id)?;
                }
                self.stored_contract(tenant, id)?
            }
            ServiceLineItemEvent::Closed(e) => {
                self.store().merge(
                    tenant,
                    EntityMerge::new(labels::SERVICE_LINE_ITEM, id)
                        .always("ended_at", json!(e.ended_at))
                        .always("canceled", json!(e.canceled)),
                )?;
                self.stored_contract(tenant, id)?
            }
            ServiceLineItemEvent::Deleted(_) => {
                let contract_id = self.stored_contract(tenant, id)?;
                self.store().delete(tenant, &node)?;
                contract_id
            }
        };

        if let Some(contract_id) = contract_id {
            let ctx = CascadeContext::from_envelope(&env);
            self.cascade.renewal_arr(&ctx, contract_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use custos_contract::{BilledType, ServiceLineItemClosed, ServiceLineItemCreated, ServiceLineItemDeleted};
    use custos_core::SourceFields;
    use custos_opportunity::{OpportunityCommand, RenewalField};

    use super::*;
    use crate::cascade::OutboundCommand;
    use crate::projections::testing::{Harness, recorded, tenant};

    fn projector(h: &Harness) -> ServiceLineItemProjector {
        ServiceLineItemProjector::new(h.store.clone(), h.cascade.clone())
    }

    /// A live twelve-month contract with an open renewal.
    fn contract_with_renewal(h: &Harness) -> EntityId {
        let contract = EntityId::new();
        let renewal = EntityId::new();
        h.store
            .merge(
                &tenant(),
                EntityMerge::new(labels::CONTRACT, contract)
                    .always("length_in_months", json!(12))
                    .always("approved", json!(true))
                    .always("service_started_at", json!(Utc::now() - Duration::days(10))),
            )
            .unwrap();
        h.store
            .merge(
                &tenant(),
                EntityMerge::new(labels::OPPORTUNITY, renewal)
                    .always("internal_type", json!("RENEWAL"))
                    .always("internal_stage", json!("OPEN"))
                    .always("renewal_adjusted_rate", json!(50)),
            )
            .unwrap();
        h.store
            .relate(
                &tenant(),
                Relation::new(
                    NodeRef::new(labels::CONTRACT, contract),
                    relations::ACTIVE_RENEWAL,
                    NodeRef::new(labels::OPPORTUNITY, renewal),
                ),
            )
            .unwrap();
        contract
    }

    fn created(contract_id: EntityId, billed: BilledType, price: f64) -> ServiceLineItemEvent {
        ServiceLineItemEvent::Created(ServiceLineItemCreated {
            contract_id,
            parent_id: None,
            fields: ServiceLineItemFields {
                name: "Seats".into(),
                billed,
                price,
                quantity: 2,
                comments: String::new(),
            },
            started_at: Some(Utc::now() - Duration::days(10)),
            ended_at: None,
            source: SourceFields::openline("web"),
        })
    }

    fn last_arr_update(h: &Harness) -> Option<(f64, f64)> {
        h.gateway.sent().into_iter().rev().find_map(|c| match c {
            OutboundCommand::Opportunity(OpportunityCommand::UpdateRenewal(u))
                if u.mask.includes(RenewalField::MaxAmount) =>
            {
                Some((u.update.amount, u.update.max_amount))
            }
            _ => None,
        })
    }

    #[test]
    fn new_item_recomputes_the_renewal_arr() {
        let h = Harness::new();
        let p = projector(&h);
        let contract = contract_with_renewal(&h);
        let item = EntityId::new();

        p.handle(&recorded("service_line_item", item, 1, created(contract, BilledType::Monthly, 50.0)))
            .unwrap();

        assert_eq!(queries::service_line_items_of(h.store.as_ref(), &tenant(), contract).unwrap().len(), 1);
        // 50 × 2 × 12 = 1200 max, at a 50% rate.
        assert_eq!(last_arr_update(&h), Some((600.0, 1200.0)));
    }

    #[test]
    fn closed_items_stop_counting() {
        let h = Harness::new();
        let p = projector(&h);
        let contract = contract_with_renewal(&h);
        let item = EntityId::new();
        p.handle(&recorded("service_line_item", item, 1, created(contract, BilledType::Annually, 100.0)))
            .unwrap();

        p.handle(&recorded(
            "service_line_item",
            item,
            2,
            ServiceLineItemEvent::Closed(ServiceLineItemClosed {
                ended_at: Utc::now() - Duration::minutes(1),
                canceled: true,
            }),
        ))
        .unwrap();

        let stored = queries::load::<ServiceLineItemView>(h.store.as_ref(), &tenant(), labels::SERVICE_LINE_ITEM, item)
            .unwrap()
            .unwrap();
        assert!(stored.view.canceled);
        assert_eq!(last_arr_update(&h), Some((0.0, 0.0)));
    }

    #[test]
    fn deleted_items_are_removed() {
        let h = Harness::new();
        let p = projector(&h);
        let contract = contract_with_renewal(&h);
        let item = EntityId::new();
        p.handle(&recorded("service_line_item", item, 1, created(contract, BilledType::Quarterly, 10.0)))
            .unwrap();

        p.handle(&recorded(
            "service_line_item",
            item,
            2,
            ServiceLineItemEvent::Deleted(ServiceLineItemDeleted {}),
        ))
        .unwrap();

        assert!(queries::service_line_items_of(h.store.as_ref(), &tenant(), contract).unwrap().is_empty());
        assert_eq!(last_arr_update(&h), Some((0.0, 0.0)));
    }
}
