//! Event trait and type-keyed payload decoding.
//!
//! Events are persisted as `(event_type, JSON payload)`. Replay and projection decode
//! them back into a typed enum by looking the type string up in a table generated by
//! [`impl_event_codec!`](crate::impl_event_codec).
//!
//! Three outcomes are possible when decoding:
//!
//! - a known type decodes into its variant,
//! - an internal type (prefixed with `$`) decodes to `None` and must be skipped,
//! - anything else is [`DecodeError::UnknownEventType`], a hard failure.

use thiserror::Error;

use custos_core::{DomainError, INTERNAL_STREAM_PREFIX};

/// Whether an event type is broker bookkeeping rather than business data.
pub fn is_internal_event_type(event_type: &str) -> bool {
    event_type.starts_with(INTERNAL_STREAM_PREFIX)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("malformed payload for {event_type}: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid stream: {0}")]
    InvalidStream(String),
}

impl From<DecodeError> for DomainError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::UnknownEventType(t) => DomainError::InvalidEventType(t),
            DecodeError::Payload { event_type, source } => {
                DomainError::validation(format!("{event_type}: {source}"))
            }
            DecodeError::InvalidStream(s) => DomainError::invalid_id(s),
        }
    }
}

/// A domain event: an immutable fact.
///
/// Implementations are usually enums of payload structs, one variant per event type.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type name persisted alongside the payload.
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn version(&self) -> u32 {
        1
    }

    /// Serialize the payload (without the type tag).
    fn encode(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Decode a stored payload. `Ok(None)` means an internal event to skip.
    fn decode(event_type: &str, payload: &serde_json::Value) -> Result<Option<Self>, DecodeError>
    where
        Self: Sized;
}

/// Implement [`Event`] for an enum whose variants each wrap one payload struct.
///
/// ```ignore
/// impl_event_codec!(ContractEvent {
///     Created => "contract.created",
///     Updated => "contract.updated",
/// });
/// ```
#[macro_export]
macro_rules! impl_event_codec {
    ($enum:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $enum {
            /// Every event type this enum decodes.
            pub const EVENT_TYPES: &'static [&'static str] = &[$($name),+];
        }

        impl $crate::Event for $enum {
            fn event_type(&self) -> &'static str {
                match self {
                    $($enum::$variant(_) => $name,)+
                }
            }

            fn encode(&self) -> Result<$crate::__serde_json::Value, $crate::__serde_json::Error> {
                match self {
                    $($enum::$variant(e) => $crate::__serde_json::to_value(e),)+
                }
            }

            fn decode(
                event_type: &str,
                payload: &$crate::__serde_json::Value,
            ) -> Result<Option<Self>, $crate::DecodeError> {
                match event_type {
                    $($name => $crate::__serde_json::from_value(payload.clone())
                        .map(|e| Some($enum::$variant(e)))
                        .map_err(|source| $crate::DecodeError::Payload {
                            event_type: event_type.to_string(),
                            source,
                        }),)+
                    other if $crate::is_internal_event_type(other) => Ok(None),
                    other => Err($crate::DecodeError::UnknownEventType(other.to_string())),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Opened {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SampleEvent {
        Opened(Opened),
        Renamed(Renamed),
    }

    crate::impl_event_codec!(SampleEvent {
        Opened => "sample.opened",
        Renamed => "sample.renamed",
    });

    #[test]
    fn known_types_decode_into_their_variant() {
        let decoded = SampleEvent::decode("sample.renamed", &json!({"name": "b"})).unwrap();
        assert_eq!(decoded, Some(SampleEvent::Renamed(Renamed { name: "b".into() })));
    }

    #[test]
    fn internal_types_are_skipped() {
        assert_eq!(SampleEvent::decode("$metadata", &json!({})).unwrap(), None);
    }

    #[test]
    fn unknown_types_are_hard_failures() {
        let err = SampleEvent::decode("sample.closed", &json!({})).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEventType(t) if t == "sample.closed"));
    }

    #[test]
    fn malformed_payload_names_the_event_type() {
        let err = SampleEvent::decode("sample.opened", &json!({"name": 3})).unwrap_err();
        match err {
            DecodeError::Payload { event_type, .. } => assert_eq!(event_type, "sample.opened"),
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_maps_to_invalid_event_type() {
        let err: DomainError = DecodeError::UnknownEventType("x".into()).into();
        assert_eq!(err, DomainError::InvalidEventType("x".into()));
    }

    #[test]
    fn encode_drops_the_type_tag() {
        let event = SampleEvent::Opened(Opened { name: "a".into() });
        assert_eq!(event.event_type(), "sample.opened");
        assert_eq!(event.encode().unwrap(), json!({"name": "a"}));
        assert_eq!(SampleEvent::EVENT_TYPES, &["sample.opened", "sample.renamed"]);
    }
}
