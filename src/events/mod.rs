//! Domain events exchanged between services.
//!
//! A [`DomainEvent`] is an immutable fact: a stable `type` (also the routing
//! key), a self-describing `payload`, the instant it occurred and optional
//! tracing metadata. On the wire it is a UTF-8 JSON object:
//!
//! ```text
//! {"type": "...", "payload": {...}, "occurredAt": "2024-01-01T00:00:00.000Z",
//!  "metadata": {"correlationId": "...", "causationId": "...", "version": 1}}
//! ```

pub mod types;

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use types::{
    UserCreated, UserRegistered, AUTH_EVENTS_EXCHANGE, AUTH_EVENTS_QUEUE, AUTH_USER_REGISTERED,
    USER_CREATED, USER_EVENTS_EXCHANGE,
};

/// Content type of encoded envelopes.
pub const CONTENT_TYPE: &str = "application/json";

/// Payload schema version stamped by the publisher.
pub const SCHEMA_VERSION: u32 = 1;

/// Untyped payload as it arrives off the wire. Field order is preserved.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Envelope decoded without knowledge of the payload schema.
pub type InboundEvent = DomainEvent<Payload>;

/// Errors from encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Payload does not match '{event_type}': {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Tracing metadata carried alongside a fact. Every field is optional and
/// consumers never require any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl EventMetadata {
    /// Metadata carrying only the current schema version.
    pub fn versioned() -> Self {
        Self {
            version: Some(SCHEMA_VERSION),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// An immutable fact exchanged between services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent<P> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: P,
    #[serde(with = "iso8601")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl<P> DomainEvent<P> {
    /// Build a fresh fact occurring now, stamped with the schema version.
    ///
    /// `occurred_at` is truncated to milliseconds so the wire representation
    /// is lossless.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            occurred_at: now_millis(),
            metadata: Some(EventMetadata::versioned()),
        }
    }

    /// Replace the metadata block.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.correlation_id.as_deref())
    }
}

impl<P: Serialize> DomainEvent<P> {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }
}

impl<P: DeserializeOwned> DomainEvent<P> {
    /// Parse the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

impl InboundEvent {
    /// Convert the untyped payload into a typed one, keeping the envelope.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<DomainEvent<T>, CodecError> {
        let payload = serde_json::from_value(serde_json::Value::Object(self.payload)).map_err(
            |source| CodecError::Payload {
                event_type: self.event_type.clone(),
                source,
            },
        )?;
        Ok(DomainEvent {
            event_type: self.event_type,
            payload,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
        })
    }

    /// String value of a top-level payload field.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

/// Current time truncated to millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// ISO-8601 timestamps with millisecond precision and a `Z` suffix, the
/// format JavaScript's `Date.toISOString()` emits. Any RFC 3339 timestamp is
/// accepted on input.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
