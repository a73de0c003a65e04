//! `custos-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the aggregate contract, field masks and provenance value objects.

pub mod aggregate;
pub mod error;
pub mod field_mask;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use field_mask::FieldMask;
pub use id::{EntityId, INTERNAL_STREAM_PREFIX, StreamId, TenantId, UserId};
pub use value_object::{
    APP_SOURCE_SUBSCRIBERS, ExternalSystem, SOURCE_OPENLINE, SourceFields, ValueObject,
};
