//! Domain events published on the request topic.
//!
//! [`RequestEvent`] is the payload; [`DomainEvent`] wraps it with the envelope
//! fields every consumer relies on (event id for dedupe, per-request sequence
//! for ordering, correlation id, emission time).

use crate::types::{Beneficiary, BenefitType, Origin, PaymentChannel, PaymentDetails, PendencyId, RequestId, RequestStatus, RequesterInfo, UserId};
use benefits_core::event::{Event, EventError, EventMetadata, SerializedEvent};
use benefits_core::stream::StreamId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default topic for request events.
pub const EVENT_TOPIC: &str = "benefit-request-events";

const STREAM_PREFIX: &str = "request-";

/// Pendency listed in a [`RequestEvent::RequestPended`] event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendencySummary {
    /// Pendency id, for later resolution
    pub id: PendencyId,
    /// What must be fixed
    pub description: String,
}

/// Events emitted by request operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    /// A request was created in `Draft`
    RequestCreated {
        /// Benefit type
        benefit_type: BenefitType,
        /// Beneficiary
        beneficiary: Beneficiary,
        /// Requester
        requester: RequesterInfo,
        /// Intake channel
        origin: Origin,
        /// Configuration revision of the pinned route
        route_version: u32,
    },

    /// A draft was submitted
    RequestSubmitted {
        /// Status the request landed in (`Open` or `InAnalysis`)
        status: RequestStatus,
    },

    /// The reviewer raised pendencies
    RequestPended {
        /// Reviewer justification
        justification: String,
        /// Items raised
        pendencies: Vec<PendencySummary>,
        /// Analysis cycle the items belong to
        cycle: u32,
    },

    /// The final approval gate was passed
    RequestApproved {
        /// Actor that passed the final gate
        approved_by: UserId,
        /// Gate names in the order they were passed
        gates: Vec<String>,
    },

    /// The reviewer rejected the request
    RequestRejected {
        /// Reviewer justification
        justification: String,
    },

    /// Pendencies were resolved and the request went back to analysis
    RequestResubmitted {
        /// Cycle whose pendencies were resolved
        cycle: u32,
    },

    /// The benefit was handed over
    RequestReleased {
        /// Payment registered by the unit
        payment: PaymentDetails,
        /// Channel the payment went to
        channel: PaymentChannel,
    },

    /// Delivery was confirmed
    RequestCompleted {
        /// Delivery confirmation
        delivery_note: String,
    },

    /// The request was cancelled
    RequestCancelled {
        /// Reason given
        reason: String,
        /// Status the request left
        from: RequestStatus,
    },
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "RequestCreated",
            Self::RequestSubmitted { .. } => "RequestSubmitted",
            Self::RequestPended { .. } => "RequestPended",
            Self::RequestApproved { .. } => "RequestApproved",
            Self::RequestRejected { .. } => "RequestRejected",
            Self::RequestResubmitted { .. } => "RequestResubmitted",
            Self::RequestReleased { .. } => "RequestReleased",
            Self::RequestCompleted { .. } => "RequestCompleted",
            Self::RequestCancelled { .. } => "RequestCancelled",
        }
    }
}

/// A request event with its envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique id
    pub event_id: Uuid,
    /// Source aggregate
    pub request_id: RequestId,
    /// Per-request emission counter, starting at 1
    pub sequence: u64,
    /// Correlation id of the call that produced the event
    pub correlation_id: Uuid,
    /// Emission time
    pub occurred_at: DateTime<Utc>,
    /// The event itself
    pub payload: RequestEvent,
}

impl DomainEvent {
    /// Type tag of the payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Stream id of a request, used as the bus partition key.
    #[must_use]
    pub fn stream_id(request_id: RequestId) -> StreamId {
        StreamId::new(format!("{STREAM_PREFIX}{request_id}"))
    }

    /// Serialize for the event bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        let metadata = EventMetadata::new(self.occurred_at)
            .with_event_id(self.event_id)
            .with_correlation_id(self.correlation_id);
        SerializedEvent::from_event(
            &self.payload,
            Self::stream_id(self.request_id),
            self.sequence,
            metadata,
        )
    }

    /// Rebuild from a bus envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the payload does not decode, the tag does not
    /// match, or the aggregate id is not a request stream.
    pub fn from_serialized(event: &SerializedEvent) -> Result<Self, EventError> {
        let payload: RequestEvent = event.decode()?;
        let request_id = event
            .aggregate_id
            .as_str()
            .strip_prefix(STREAM_PREFIX)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(RequestId::from_uuid)
            .ok_or_else(|| {
                EventError::DeserializationError(format!(
                    "not a request stream: {}",
                    event.aggregate_id
                ))
            })?;

        Ok(Self {
            event_id: event.metadata.event_id,
            request_id,
            sequence: event.sequence,
            correlation_id: event.metadata.correlation_id.unwrap_or_default(),
            occurred_at: event.metadata.occurred_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)] // Test code

    use super::*;
    use crate::types::PaymentMethod;

    fn released() -> DomainEvent {
        DomainEvent {
            event_id: Uuid::new_v4(),
            request_id: RequestId::new(),
            sequence: 7,
            correlation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload: RequestEvent::RequestReleased {
                payment: PaymentDetails {
                    amount_cents: 50_000,
                    method: PaymentMethod::Pix,
                    reference: Some("E2E-123".to_string()),
                },
                channel: PaymentChannel::Pix {
                    key: "ana@example.org".to_string(),
                },
            },
        }
    }

    #[test]
    fn envelope_survives_the_bus_format() {
        let event = released();
        let serialized = event.to_serialized().unwrap();

        assert_eq!(serialized.event_type, "RequestReleased");
        assert_eq!(serialized.event_id(), event.event_id);
        assert_eq!(serialized.aggregate_id, DomainEvent::stream_id(event.request_id));
        assert_eq!(DomainEvent::from_serialized(&serialized).unwrap(), event);
    }

    #[test]
    fn foreign_stream_is_rejected() {
        let mut serialized = released().to_serialized().unwrap();
        serialized.aggregate_id = StreamId::new("citizen-1");
        assert!(matches!(
            DomainEvent::from_serialized(&serialized),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn tags_match_variant_names() {
        let event = RequestEvent::RequestCancelled {
            reason: "duplicate".to_string(),
            from: RequestStatus::Draft,
        };
        assert_eq!(event.event_type(), "RequestCancelled");
    }
}
