//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Streams and event types starting with this prefix are broker bookkeeping,
/// never business data.
pub const INTERNAL_STREAM_PREFIX: &str = "$";

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenants are addressed by their stable name, which is also embedded in stream ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("TenantId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identifier of a user (actor identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of a business entity, shared by its aggregate and its read-model record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UserId, "UserId");
impl_uuid_newtype!(EntityId, "EntityId");

/// Name of an event stream: `"{aggregate_type}-{tenant}-{entity_id}"`.
///
/// Broker-internal streams (prefixed with [`INTERNAL_STREAM_PREFIX`]) share the same
/// namespace and must be recognisable without parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn for_entity(aggregate_type: &str, tenant: &TenantId, entity_id: &EntityId) -> Self {
        Self(format!("{aggregate_type}-{tenant}-{entity_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_internal(&self) -> bool {
        self.0.starts_with(INTERNAL_STREAM_PREFIX)
    }

    /// Recover the entity id by stripping the `"{aggregate_type}-{tenant}-"` prefix.
    pub fn entity_id(&self, aggregate_type: &str, tenant: &TenantId) -> Result<EntityId, DomainError> {
        let prefix = format!("{aggregate_type}-{tenant}-");
        let raw = self.0.strip_prefix(&prefix).ok_or_else(|| {
            DomainError::invalid_id(format!(
                "stream {} does not belong to {aggregate_type}/{tenant}",
                self.0
            ))
        })?;
        raw.parse()
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trips_entity_id_for_dashed_tenant() {
        let tenant = TenantId::new("acme-eu");
        let id = EntityId::new();
        let stream = StreamId::for_entity("contract", &tenant, &id);

        assert_eq!(stream.entity_id("contract", &tenant).unwrap(), id);
        assert!(!stream.is_internal());
    }

    #[test]
    fn stream_id_rejects_foreign_aggregate_type() {
        let tenant = TenantId::new("acme");
        let stream = StreamId::for_entity("contract", &tenant, &EntityId::new());

        let err = stream.entity_id("opportunity", &tenant).unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    #[test]
    fn internal_streams_are_detected_by_prefix() {
        assert!(StreamId::from("$ce-contract").is_internal());
        assert!(StreamId::from("$$metadata").is_internal());
        assert!(!StreamId::from("organization-acme-1").is_internal());
    }

    #[test]
    fn tenant_id_rejects_blank_names() {
        assert!("  ".parse::<TenantId>().is_err());
        assert_eq!("acme".parse::<TenantId>().unwrap().as_str(), "acme");
    }
}
