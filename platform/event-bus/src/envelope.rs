//! # Event Envelope
//!
//! Catalog-wide wire format for every event crossing a service boundary.
//!
//! ## Envelope Fields
//!
//! - `event_type`: hierarchical `<entity>.<action>` name; always equals the
//!   routing key the envelope was published under
//! - `timestamp`: ISO 8601 UTC instant at publish time
//! - `data`: event-specific payload object
//! - `event_id`: unique id used for de-duplication (optional on the wire so
//!   envelopes from older producers still parse)
//!
//! Envelopes are serialized as UTF-8 JSON and never mutated after construction.

use crate::topology::validate_routing_key;
use crate::{BusError, BusMessage, BusResult, JSON_CONTENT_TYPE};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Standard event envelope following the catalog event contract
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type; consumers see `serde_json::Value`
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "user.registered",
///     json!({"user_id": 123, "email": "a@b.com", "name": "A"}),
/// );
/// assert_eq!(envelope.event_type, "user.registered");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T = serde_json::Value> {
    /// Unique event identifier (idempotency key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,

    /// Routing key and event name, e.g. "course.enrolled"
    pub event_type: String,

    /// UTC instant the event was published
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload
    pub data: T,
}

/// Reasons an incoming message is not a valid envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid event_type: {0}")]
    InvalidEventType(String),

    #[error("envelope data must be a JSON object")]
    DataNotObject,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope stamped with a fresh event_id and the current time
    pub fn new(event_type: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Some(Uuid::new_v4()),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Override the timestamp (publishers use their monotonic clock)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Override the event_id (useful for testing and replays)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Canonical UTF-8 JSON encoding
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::SerializationError(e.to_string()))
    }

    /// Convert into a generic JSON envelope, rejecting payloads that are not objects
    pub fn into_json(self) -> BusResult<EventEnvelope> {
        let data = serde_json::to_value(&self.data)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        if !data.is_object() {
            return Err(BusError::SerializationError(format!(
                "payload for '{}' must serialize to a JSON object",
                self.event_type
            )));
        }

        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            data,
        })
    }

    /// Build the persistent, JSON-typed bus message for this envelope
    pub fn to_message(&self) -> BusResult<BusMessage> {
        validate_routing_key(&self.event_type)?;

        let mut message = BusMessage::new(self.event_type.clone(), self.to_bytes()?)
            .with_content_type(JSON_CONTENT_TYPE)
            .persistent();
        if let Some(event_id) = self.event_id {
            message = message.with_message_id(event_id.to_string());
        }

        Ok(message)
    }
}

impl EventEnvelope {
    /// Parse and validate an envelope from a message body
    ///
    /// # Validation Rules
    ///
    /// - body must be a JSON object with `event_type`, `timestamp`, and `data`
    /// - `event_type` must be a concrete routing key
    /// - `data` must be a JSON object
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)?;

        validate_routing_key(&envelope.event_type)
            .map_err(|e| EnvelopeError::InvalidEventType(e.to_string()))?;

        if !envelope.data.is_object() {
            return Err(EnvelopeError::DataNotObject);
        }

        Ok(envelope)
    }

    /// Deserialize `data` into the typed payload for this event type
    pub fn decode_data<D: DeserializeOwned>(&self) -> Result<D, serde_json::Error> {
        D::deserialize(&self.data)
    }
}

/// Hands out publish timestamps that never go backwards within one publisher,
/// even if the wall clock is stepped back
#[derive(Debug)]
pub struct EventClock {
    last: Mutex<DateTime<Utc>>,
}

impl EventClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if wall > *last {
            *last = wall;
        }
        *last
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new()
    }
}
