//! Infrastructure layer: event store, read model, brokers, projections and the
//! subscriber worker pool.

pub mod cascade;
pub mod command_dispatcher;
pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod workers;
