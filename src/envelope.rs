use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key carrying the correlation identifier of a causal chain.
pub const CORRELATION_ID: &str = "correlation_id";
/// Metadata key carrying the logical event type name.
pub const EVENT_TYPE: &str = "type";
/// Metadata key carrying the caller-supplied deduplication token.
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";
/// Metadata key carrying the RFC 3339 publication time.
pub const PUBLISHED_AT: &str = "published_at";

/// Globally unique envelope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EnvelopeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ordered string-to-string metadata attached to an [`Envelope`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID).filter(|id| !id.is_empty())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.get(EVENT_TYPE)
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.get(IDEMPOTENCY_KEY).filter(|key| !key.is_empty())
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Message container moved through the outbox, the relay and the router.
///
/// An `Envelope` is immutable once created: the builder-style methods consume
/// it and return a new value, and the identifier is only ever generated, never
/// reassigned.
///
/// The `topic` is routing information. It is kept next to the envelope while
/// the envelope travels through the pipeline, but it is not part of the wire
/// shape (see [`WireEnvelope`]).
///
/// ## Example
///
/// ```rust
/// use outpost::Envelope;
///
/// let envelope = Envelope::new("TicketBookingConfirmed", br#"{"ticket_id":"t-1"}"#.to_vec())
///     .with_metadata("correlation_id", "req-42");
///
/// assert_eq!(envelope.topic(), "TicketBookingConfirmed");
/// assert_eq!(envelope.metadata().correlation_id(), Some("req-42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    topic: String,
    payload: Vec<u8>,
    metadata: Metadata,
}

impl Envelope {
    /// Create an envelope with a fresh identifier and empty metadata.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: EnvelopeId::new(),
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Rebuild an envelope from stored parts.
    ///
    /// Used by store and transport backends when reading back an envelope that
    /// was created earlier; it never mints a new identifier.
    pub fn from_parts(
        id: EnvelopeId,
        topic: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Re-address the envelope to another topic, keeping id, payload and metadata.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_wire(self) -> (String, WireEnvelope) {
        (
            self.topic,
            WireEnvelope {
                id: self.id.to_string(),
                payload: self.payload,
                metadata: self.metadata,
            },
        )
    }
}

/// Transport-facing shape of an envelope: `{id, payload, metadata}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: String,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
}

impl WireEnvelope {
    /// Attach the topic the wire envelope was received on.
    ///
    /// Fails when the id is not a valid UUID.
    pub fn into_envelope(self, topic: impl Into<String>) -> Result<Envelope, uuid::Error> {
        let id = Uuid::parse_str(&self.id)?;
        Ok(Envelope::from_parts(id.into(), topic, self.payload, self.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelopes_never_share_an_id() {
        let a = Envelope::new("topic", b"{}".to_vec());
        let b = Envelope::new("topic", b"{}".to_vec());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_correlation_id_reads_as_missing() {
        let envelope = Envelope::new("topic", Vec::new()).with_metadata(CORRELATION_ID, "");
        assert_eq!(envelope.metadata().correlation_id(), None);
    }

    #[test]
    fn wire_shape_keeps_id_and_metadata() {
        let envelope = Envelope::new("TicketPrinted", b"{}".to_vec())
            .with_metadata(EVENT_TYPE, "TicketPrinted")
            .with_metadata(IDEMPOTENCY_KEY, "key-1");
        let id = envelope.id();

        let (topic, wire) = envelope.into_wire();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["metadata"]["type"], "TicketPrinted");
        assert!(json.get("topic").is_none());

        let back = wire.into_envelope(topic).unwrap();
        assert_eq!(back.id(), id);
        assert_eq!(back.metadata().idempotency_key(), Some("key-1"));
    }
}
