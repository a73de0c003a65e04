//! Contract domain module (event-sourced).
//!
//! Contracts and their service line items, plus the pure status derivation shared
//! with the projection side.

pub mod contract;
pub mod service_line_item;
pub mod status;

pub use contract::{
    Contract, ContractCommand, ContractCreated, ContractDeleted, ContractEvent, ContractField,
    ContractFields, ContractStatusRefreshRequested, ContractUpdated, CreateContract,
    DeleteContract, RefreshContractStatus, UpdateContract, billing_cycle_in_months,
};
pub use service_line_item::{
    BilledType, CloseServiceLineItem, CreateServiceLineItem, DeleteServiceLineItem,
    ServiceLineItem, ServiceLineItemClosed, ServiceLineItemCommand, ServiceLineItemCreated,
    ServiceLineItemDeleted, ServiceLineItemEvent, ServiceLineItemFields, ServiceLineItemUpdated,
    UpdateServiceLineItem,
};
pub use status::{ContractStatus, StatusInputs, derive_status};
