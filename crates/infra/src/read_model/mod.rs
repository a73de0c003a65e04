//! Tenant-isolated read model.
//!
//! The read model is disposable: every record can be rebuilt by replaying the event
//! log through the projectors.

pub mod in_memory;
pub mod model;
pub mod postgres;
pub mod queries;
pub mod store;
pub mod views;

pub use in_memory::InMemoryReadModel;
pub use model::{
    ActionEntry, EntityMerge, EntityRecord, FieldWrite, MergeOutcome, NodeRef, RelatedItem, Relation,
    WritePolicy, labels, relations,
};
pub use postgres::PostgresReadModel;
pub use queries::Loaded;
pub use store::{ReadModelError, ReadModelStore};
pub use views::{
    ContactView, ContractView, InvoiceLineView, InvoiceView, OpportunityView, OrganizationView, ServiceLineItemView, view,
};
