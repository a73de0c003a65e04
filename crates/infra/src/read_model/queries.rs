//! Graph traversals shared by projectors and cascades.
//!
//! Every helper goes through [`ReadModelStore`] only, so they work against any backend.
//! Soft-deleted records are skipped unless stated otherwise.

use serde::de::DeserializeOwned;

use custos_core::{EntityId, TenantId};

use super::model::{EntityRecord, NodeRef, labels, relations};
use super::store::{ReadModelError, ReadModelStore};
use super::views::{ContactView, ContractView, OpportunityView, ServiceLineItemView, view};

/// A record together with its typed view.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub record: EntityRecord,
    pub view: T,
}

impl<T> Loaded<T> {
    pub fn id(&self) -> EntityId {
        self.record.id
    }
}

/// Fetch one record and deserialize it. `None` when absent or soft-deleted.
pub fn load<T: DeserializeOwned>(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    label: &str,
    id: EntityId,
) -> Result<Option<Loaded<T>>, ReadModelError> {
    match store.get(tenant, &NodeRef::new(label, id))? {
        Some(record) if !record.deleted => {
            let view = view(&record)?;
            Ok(Some(Loaded { record, view }))
        }
        _ => Ok(None),
    }
}

fn targets<T: DeserializeOwned>(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    from: &NodeRef,
    kind: &str,
) -> Result<Vec<Loaded<T>>, ReadModelError> {
    let mut out = Vec::new();
    for relation in store.related(tenant, from, kind)? {
        if let Some(loaded) = load(store, tenant, &relation.to.label, relation.to.id)? {
            out.push(loaded);
        }
    }
    Ok(out)
}

pub fn contact(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    id: EntityId,
) -> Result<Option<Loaded<ContactView>>, ReadModelError> {
    load(store, tenant, labels::CONTACT, id)
}

pub fn contract(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    id: EntityId,
) -> Result<Option<Loaded<ContractView>>, ReadModelError> {
    load(store, tenant, labels::CONTRACT, id)
}

pub fn opportunity(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    id: EntityId,
) -> Result<Option<Loaded<OpportunityView>>, ReadModelError> {
    load(store, tenant, labels::OPPORTUNITY, id)
}

/// Contracts of an organization.
pub fn contracts_of(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    organization_id: EntityId,
) -> Result<Vec<Loaded<ContractView>>, ReadModelError> {
    let org = NodeRef::new(labels::ORGANIZATION, organization_id);
    targets(store, tenant, &org, relations::HAS_CONTRACT)
}

/// Contacts holding a job role at an organization.
pub fn contacts_of(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    organization_id: EntityId,
) -> Result<Vec<Loaded<ContactView>>, ReadModelError> {
    let org = NodeRef::new(labels::ORGANIZATION, organization_id);
    let mut out = Vec::new();
    for relation in store.related_from(tenant, relations::WORKS_AT, &org)? {
        if let Some(loaded) = load(store, tenant, labels::CONTACT, relation.from.id)? {
            out.push(loaded);
        }
    }
    Ok(out)
}

/// Service line items of a contract.
pub fn service_line_items_of(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    contract_id: EntityId,
) -> Result<Vec<Loaded<ServiceLineItemView>>, ReadModelError> {
    let contract = NodeRef::new(labels::CONTRACT, contract_id);
    targets(store, tenant, &contract, relations::HAS_SERVICE)
}

/// Every opportunity attached to a contract, closed and suspended ones included.
pub fn opportunities_of_contract(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    contract_id: EntityId,
) -> Result<Vec<Loaded<OpportunityView>>, ReadModelError> {
    let contract = NodeRef::new(labels::CONTRACT, contract_id);
    targets(store, tenant, &contract, relations::HAS_OPPORTUNITY)
}

/// The contract's open renewal, if any.
pub fn active_renewal(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    contract_id: EntityId,
) -> Result<Option<Loaded<OpportunityView>>, ReadModelError> {
    let contract = NodeRef::new(labels::CONTRACT, contract_id);
    let mut open = targets::<OpportunityView>(store, tenant, &contract, relations::ACTIVE_RENEWAL)?
        .into_iter()
        .filter(|o| o.view.is_open_renewal())
        .collect::<Vec<_>>();
    // Latest wins if a race ever left two edges behind.
    open.sort_by_key(|o| o.record.created_at);
    Ok(open.pop())
}

/// Open renewals across every non-deleted contract of an organization.
pub fn open_renewals_of(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    organization_id: EntityId,
) -> Result<Vec<Loaded<OpportunityView>>, ReadModelError> {
    let mut out = Vec::new();
    for contract in contracts_of(store, tenant, organization_id)? {
        if let Some(renewal) = active_renewal(store, tenant, contract.id())? {
            out.push(renewal);
        }
    }
    Ok(out)
}

/// Owning organization of an opportunity, directly or through its contract.
pub fn organization_of_opportunity(
    store: &dyn ReadModelStore,
    tenant: &TenantId,
    opportunity: &OpportunityView,
) -> Result<Option<EntityId>, ReadModelError> {
    if opportunity.organization_id.is_some() {
        return Ok(opportunity.organization_id);
    }
    let Some(contract_id) = opportunity.contract_id else {
        return Ok(None);
    };
    Ok(contract(store, tenant, contract_id)?.and_then(|c| c.view.organization_id))
}
