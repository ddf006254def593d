//! Event bus seam between the workflow and its downstream consumers.
//!
//! The workflow never calls notification or integration code directly. A
//! committed operation writes its events to an outbox; a relay drains the
//! outbox and publishes each [`SerializedEvent`] to a topic on an
//! [`EventBus`]. Subscribers (the notification projector, integrations)
//! consume the topic on their own schedule.
//!
//! ```text
//! service ──commit──▶ outbox ──relay──▶ EventBus ──▶ subscribers
//! ```
//!
//! Delivery is at-least-once. Subscribers dedupe on
//! [`SerializedEvent::event_id`]. Events of one aggregate are published in
//! emission order; `aggregate_id` is the partition key for transports that
//! partition topics.

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A subscriber fell behind and missed events
    #[error("Subscriber lagged, {skipped} events skipped")]
    Lagged {
        /// Number of events the subscriber missed
        skipped: u64,
    },

    /// Topic name is empty or otherwise unusable
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// The bus was shut down
    #[error("Event bus closed")]
    Closed,
}

/// Stream of events delivered to a subscriber.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Publish/subscribe transport for serialized events.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn EventBus>` by the relay and by effect futures.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the transport rejects the event.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// Only events published after the subscription is established are
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot
    /// be established.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
