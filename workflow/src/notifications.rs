//! Reference notification projector.
//!
//! Subscribes to the request topic and hands one [`Notification`] per new
//! event to a [`NotificationSender`]. The relay publishes a request's events
//! in sequence order, so the projector keeps one number per request: the
//! highest sequence it has accepted. Anything at or below it is a
//! redelivery. A request has at most one delivery running; later events of
//! that request wait behind it, so the sender sees them in order.
//!
//! The decision logic is a reducer run on the runtime [`Store`]; delivery is
//! an effect. Content rendering and delivery channels belong to the sender.

use crate::events::DomainEvent;
use crate::events::RequestEvent;
use crate::types::RequestId;
use benefits_core::effect::Effect;
use benefits_core::event::SerializedEvent;
use benefits_core::event_bus::{EventBus, EventBusError};
use benefits_core::reducer::Reducer;
use benefits_core::{SmallVec, smallvec};
use benefits_runtime::metrics::names;
use benefits_runtime::store::{EffectHandle, Store};
use benefits_runtime::StoreError;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Errors from the projector and senders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// The sender could not deliver
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A bus message was not a request event
    #[error("undecodable event: {0}")]
    Decode(String),

    /// The bus subscription failed
    #[error(transparent)]
    Bus(#[from] EventBusError),

    /// The projector's store is shutting down
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What gets handed to the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Source event id
    pub event_id: Uuid,
    /// Request concerned
    pub request_id: RequestId,
    /// Source event type
    pub event_type: &'static str,
    /// Correlation id of the originating call
    pub correlation_id: Uuid,
    /// One-line summary for the sender to render
    pub summary: String,
}

impl Notification {
    /// Build the notification for an event.
    #[must_use]
    pub fn for_event(event: &DomainEvent) -> Self {
        let summary = match &event.payload {
            RequestEvent::RequestCreated { benefit_type, .. } => {
                format!("{benefit_type} request opened")
            },
            RequestEvent::RequestSubmitted { status } => format!("request submitted ({status})"),
            RequestEvent::RequestPended { pendencies, .. } => {
                format!("{} pendencies to resolve", pendencies.len())
            },
            RequestEvent::RequestApproved { .. } => "request approved".to_string(),
            RequestEvent::RequestRejected { justification } => format!("request rejected: {justification}"),
            RequestEvent::RequestResubmitted { .. } => "request back in analysis".to_string(),
            RequestEvent::RequestReleased { payment, .. } => {
                format!("benefit released ({} cents)", payment.amount_cents)
            },
            RequestEvent::RequestCompleted { .. } => "delivery confirmed".to_string(),
            RequestEvent::RequestCancelled { reason, .. } => format!("request cancelled: {reason}"),
        };
        Self {
            event_id: event.event_id,
            request_id: event.request_id,
            event_type: event.event_type(),
            correlation_id: event.correlation_id,
            summary,
        }
    }
}

/// Delivers notifications (SMS, messaging channel, e-mail...).
pub trait NotificationSender: Send + Sync {
    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// [`NotificationError::Delivery`] if the channel refused it.
    fn send(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotificationError>> + Send + '_>>;
}

/// Sender that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSender;

impl NotificationSender for LoggingSender {
    fn send(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotificationError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                event_id = %notification.event_id,
                request_id = %notification.request_id,
                event_type = notification.event_type,
                summary = %notification.summary,
                "Notification sent"
            );
            Ok(())
        })
    }
}

/// Projector state.
#[derive(Clone, Debug, Default)]
pub struct NotificationState {
    /// Highest sequence accepted per request; lower or equal ones are redeliveries
    pub accepted_through: HashMap<RequestId, u64>,
    /// Requests with a delivery running, each with the events waiting behind it
    pub in_flight: HashMap<RequestId, VecDeque<DomainEvent>>,
    /// Notifications the sender accepted
    pub delivered: u64,
    /// Failed deliveries so far
    pub failures: u64,
    /// Redeliveries ignored
    pub duplicates_skipped: u64,
}

/// Projector actions.
#[derive(Clone, Debug)]
pub enum NotificationAction {
    /// An event arrived from the bus
    EventReceived {
        /// The event
        event: DomainEvent,
    },
    /// The sender accepted the notification
    Delivered {
        /// Request concerned
        request_id: RequestId,
        /// Source event id
        event_id: Uuid,
    },
    /// The sender failed; the next event of the request goes ahead
    DeliveryFailed {
        /// Request concerned
        request_id: RequestId,
        /// Source event id
        event_id: Uuid,
        /// Sender error
        reason: String,
    },
}

/// Injected dependencies of the projector.
#[derive(Clone)]
pub struct NotificationEnvironment {
    /// Delivery channel
    pub sender: Arc<dyn NotificationSender>,
}

/// Dedupe-and-deliver reducer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationReducer;

impl NotificationReducer {
    fn deliver(event: &DomainEvent, env: &NotificationEnvironment) -> Effect<NotificationAction> {
        let notification = Notification::for_event(event);
        let request_id = event.request_id;
        let event_id = event.event_id;
        let sender = Arc::clone(&env.sender);
        Effect::Future(Box::pin(async move {
            match sender.send(notification).await {
                Ok(()) => Some(NotificationAction::Delivered { request_id, event_id }),
                Err(error) => Some(NotificationAction::DeliveryFailed {
                    request_id,
                    event_id,
                    reason: error.to_string(),
                }),
            }
        }))
    }

    /// Start the next waiting event of `request_id`, or mark it idle.
    fn next_for(
        state: &mut NotificationState,
        request_id: RequestId,
        env: &NotificationEnvironment,
    ) -> SmallVec<[Effect<NotificationAction>; 4]> {
        let next = state.in_flight.get_mut(&request_id).and_then(VecDeque::pop_front);
        match next {
            Some(event) => smallvec![Self::deliver(&event, env)],
            None => {
                state.in_flight.remove(&request_id);
                SmallVec::new()
            },
        }
    }
}

impl Reducer for NotificationReducer {
    type State = NotificationState;
    type Action = NotificationAction;
    type Environment = NotificationEnvironment;

    fn reduce(
        &self,
        state: &mut NotificationState,
        action: NotificationAction,
        env: &NotificationEnvironment,
    ) -> SmallVec<[Effect<NotificationAction>; 4]> {
        match action {
            NotificationAction::EventReceived { event } => {
                let accepted = state.accepted_through.entry(event.request_id).or_insert(0);
                if event.sequence <= *accepted {
                    state.duplicates_skipped += 1;
                    metrics::counter!(names::NOTIFICATIONS_DUPLICATES_SKIPPED).increment(1);
                    tracing::debug!(
                        event_id = %event.event_id,
                        request_id = %event.request_id,
                        sequence = event.sequence,
                        "Duplicate event skipped"
                    );
                    return SmallVec::new();
                }
                *accepted = event.sequence;

                if let Some(waiting) = state.in_flight.get_mut(&event.request_id) {
                    waiting.push_back(event);
                    return SmallVec::new();
                }
                state.in_flight.insert(event.request_id, VecDeque::new());
                smallvec![Self::deliver(&event, env)]
            },

            NotificationAction::Delivered { request_id, .. } => {
                state.delivered += 1;
                metrics::counter!(names::NOTIFICATIONS_DELIVERED).increment(1);
                Self::next_for(state, request_id, env)
            },

            NotificationAction::DeliveryFailed {
                request_id,
                event_id,
                reason,
            } => {
                state.failures += 1;
                tracing::warn!(%event_id, %request_id, %reason, "Notification delivery failed");
                Self::next_for(state, request_id, env)
            },
        }
    }
}

/// Store type running the projector.
pub type NotificationStore =
    Store<NotificationState, NotificationAction, NotificationEnvironment, NotificationReducer>;

/// Subscribes to the request topic and feeds the notification store.
pub struct NotificationProjector {
    store: NotificationStore,
    bus: Arc<dyn EventBus>,
    topic: String,
    shutdown: watch::Receiver<bool>,
}

impl NotificationProjector {
    /// Create a projector.
    ///
    /// Returns the projector and a shutdown sender; send `true` to stop it.
    #[must_use]
    pub fn new(
        sender: Arc<dyn NotificationSender>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Store::new(
            NotificationState::default(),
            NotificationReducer,
            NotificationEnvironment { sender },
        );
        let projector = Self {
            store,
            bus,
            topic: topic.into(),
            shutdown: shutdown_rx,
        };
        (projector, shutdown_tx)
    }

    /// Handle to the projector's store, for state inspection.
    #[must_use]
    pub fn store(&self) -> NotificationStore {
        self.store.clone()
    }

    /// Feed one bus message to the reducer.
    ///
    /// # Errors
    ///
    /// [`NotificationError::Decode`] for foreign messages and
    /// [`NotificationError::Store`] during shutdown.
    pub async fn handle(&self, event: &SerializedEvent) -> Result<EffectHandle, NotificationError> {
        let event = DomainEvent::from_serialized(event).map_err(|e| NotificationError::Decode(e.to_string()))?;
        Ok(self.store.send(NotificationAction::EventReceived { event }).await?)
    }

    /// Subscribe, then process events in a background task until shutdown.
    ///
    /// The subscription is established before this returns, so events
    /// published afterwards are seen.
    ///
    /// # Errors
    ///
    /// [`NotificationError::Bus`] if the subscription fails.
    pub async fn start(mut self) -> Result<JoinHandle<()>, NotificationError> {
        let mut events = self.bus.subscribe(&[self.topic.as_str()]).await?;
        tracing::info!(topic = %self.topic, "Notification projector subscribed");

        Ok(tokio::spawn(async move {
            while !*self.shutdown.borrow() {
                tokio::select! {
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            if let Err(error) = self.handle(&event).await {
                                tracing::error!(%error, event_type = %event.event_type, "Failed to process event");
                            }
                        },
                        Some(Err(error)) => {
                            tracing::error!(%error, "Error receiving event from bus");
                        },
                        None => {
                            tracing::warn!(topic = %self.topic, "Event stream ended");
                            break;
                        },
                    },
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            break;
                        }
                    },
                }
            }
            tracing::info!(topic = %self.topic, "Notification projector stopped");
        }))
    }
}

impl std::fmt::Debug for NotificationProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProjector")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
