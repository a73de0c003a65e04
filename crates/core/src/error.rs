//! Domain error model.
//!
//! Every aggregate decision fails with a [`DomainError`].

use thiserror::Error;

use crate::id::EntityId;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command is malformed or not allowed in the current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Replay produced a state the aggregate cannot be in (e.g. a version gap).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targets an entity whose stream has no create event, or that was deleted.
    #[error("{aggregate_type} {id} does not exist")]
    Missing {
        aggregate_type: &'static str,
        id: EntityId,
    },

    /// The stream moved on between load and append.
    #[error("stream is at version {actual}, expected {expected}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// A non-internal event type the aggregate does not know how to apply.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn missing(aggregate_type: &'static str, id: EntityId) -> Self {
        Self::Missing { aggregate_type, id }
    }

    pub fn invalid_event_type(event_type: impl Into<String>) -> Self {
        Self::InvalidEventType(event_type.into())
    }

    /// Whether re-running the command against a fresh load may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_version_mismatches_are_retryable() {
        assert!(DomainError::VersionMismatch { expected: 2, actual: 3 }.is_retryable());
        assert!(!DomainError::validation("name is required").is_retryable());
        assert!(!DomainError::missing("contract", EntityId::new()).is_retryable());
    }

    #[test]
    fn missing_names_the_aggregate() {
        let id = EntityId::new();
        let msg = DomainError::missing("invoice", id).to_string();
        assert_eq!(msg, format!("invoice {id} does not exist"));
    }
}
