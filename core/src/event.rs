//! Event trait and the wire format used on the event bus.
//!
//! Events are immutable facts about something that already happened to an
//! aggregate. They are serialized with `bincode` for the bus; the envelope
//! ([`SerializedEvent`]) carries everything a consumer needs to route, order
//! and deduplicate the event without decoding the payload:
//!
//! - `metadata.event_id`: stable identity, reused on every redelivery
//! - `aggregate_id`: partition key, so events of one aggregate stay ordered
//! - `sequence`: per-aggregate emission counter
//! - `metadata.correlation_id`: ties the event to the call that produced it
//!
//! # Example
//!
//! ```
//! use benefits_core::event::{Event, EventMetadata, SerializedEvent};
//! use benefits_core::stream::StreamId;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
//! enum CaseEvent {
//!     CaseOpened { case: String },
//! }
//!
//! impl Event for CaseEvent {
//!     fn event_type(&self) -> &'static str {
//!         "CaseOpened"
//!     }
//! }
//!
//! let event = CaseEvent::CaseOpened { case: "c-1".to_string() };
//! let serialized = SerializedEvent::from_event(
//!     &event,
//!     StreamId::new("case-c-1"),
//!     1,
//!     EventMetadata::new(chrono::Utc::now()),
//! )
//! .unwrap();
//!
//! assert_eq!(serialized.event_type, "CaseOpened");
//! assert_eq!(serialized.decode::<CaseEvent>().unwrap(), event);
//! ```

use crate::stream::StreamId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope's type tag does not match the decoded payload.
    #[error("Event type mismatch: envelope says {envelope}, payload is {payload}")]
    TypeMismatch {
        /// Type tag carried by the envelope
        envelope: String,
        /// Type tag of the decoded payload
        payload: String,
    },
}

/// An event that can be published and replayed.
///
/// `event_type()` returns the stable tag consumers route on. Tags are part of
/// the topic contract, so renaming a variant must not change its tag.
pub trait Event: Send + Sync + 'static {
    /// Returns the type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Envelope metadata attached to every serialized event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identity; consumers dedupe on it.
    pub event_id: Uuid,

    /// Correlation id of the call that produced the event.
    pub correlation_id: Option<Uuid>,

    /// When the fact happened.
    pub occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    /// Metadata with a fresh event id and no correlation id.
    #[must_use]
    pub fn new(occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id: None,
            occurred_at,
        }
    }

    /// Use a specific event id (events rebuilt from an outbox keep their id).
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A serialized event ready for the event bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type tag (e.g. `"RequestApproved"`).
    pub event_type: String,

    /// Aggregate the event belongs to; used as the partition key.
    pub aggregate_id: StreamId,

    /// Per-aggregate emission counter, starting at 1.
    pub sequence: u64,

    /// The bincode-serialized payload.
    pub data: Vec<u8>,

    /// Identity, correlation and timing.
    pub metadata: EventMetadata,
}

impl SerializedEvent {
    /// Serialize an [`Event`] into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        aggregate_id: StreamId,
        sequence: u64,
        metadata: EventMetadata,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            aggregate_id,
            sequence,
            data: event.to_bytes()?,
            metadata,
        })
    }

    /// Decode the payload and check it against the envelope's type tag.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` for undecodable bytes and
    /// `EventError::TypeMismatch` when the payload carries a different tag.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        let event = E::from_bytes(&self.data)?;
        if event.event_type() != self.event_type {
            return Err(EventError::TypeMismatch {
                envelope: self.event_type.clone(),
                payload: event.event_type().to_string(),
            });
        }
        Ok(event)
    }

    /// Shortcut for `metadata.event_id`.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.metadata.event_id
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, aggregate: {}, seq: {}, size: {} bytes }}",
            self.event_type,
            self.aggregate_id,
            self.sequence,
            self.data.len()
        )
    }
}
