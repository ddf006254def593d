//! Outbox and relay between committed operations and the event bus.
//!
//! The request service enqueues events inside the same critical section that
//! commits the request, so the outbox order is the commit order. The
//! [`EventRelay`] drains it front to back and publishes with retry. Publish
//! failures never touch the committed request.
//!
//! An event that exhausts its retries is parked in the dead-letter queue, and
//! later events of the same request are held back until
//! [`EventRelay::replay_dead_letters`] gets the parked one out. Events of other
//! requests keep flowing. When the dead-letter queue is full the relay stops
//! draining and leaves the event at the front of the outbox, so a committed
//! event is never dropped.

use crate::events::DomainEvent;
use benefits_core::event::SerializedEvent;
use benefits_core::event_bus::{EventBus, EventBusError};
use benefits_core::stream::StreamId;
use benefits_runtime::metrics::names;
use benefits_runtime::retry::{RetriesExhausted, RetryPolicy, retry_with_backoff};
use benefits_runtime::{DeadLetter, DeadLetterQueue};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, watch};

/// In-process queue of committed, not yet published events.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<DomainEvent>>,
    notify: Notify,
}

impl Outbox {
    /// Empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events in emission order and wake the relay.
    pub fn enqueue(&self, events: impl IntoIterator<Item = DomainEvent>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queue.len();
        queue.extend(events);
        if queue.len() > before {
            self.notify.notify_one();
        }
    }

    /// Remove the oldest event.
    pub fn pop(&self) -> Option<DomainEvent> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Put an event back at the front.
    fn requeue_front(&self, event: DomainEvent) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(event);
    }

    /// Events waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the waiting events, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<DomainEvent> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Counts from one [`EventRelay::drain_once`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Events accepted by the bus
    pub published: usize,
    /// Events parked after the retry budget ran out
    pub dead_lettered: usize,
    /// Events held back behind a parked event of the same request
    pub held: usize,
    /// Events dropped because they could not be serialized
    pub unserializable: usize,
    /// The dead-letter queue was full; the pass stopped with events left in the outbox
    pub stalled: bool,
}

/// Counts from one [`EventRelay::replay_dead_letters`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Parked events published
    pub replayed: usize,
    /// Held events published after their parked predecessor
    pub released: usize,
    /// Events left in the dead-letter queue
    pub still_parked: usize,
}

/// Publishes outbox events to the bus.
///
/// Clones share the outbox, the dead-letter queue and the held events, so
/// one clone can [`run`](Self::run) while another replays dead letters.
#[derive(Clone)]
pub struct EventRelay {
    outbox: Arc<Outbox>,
    bus: Arc<dyn EventBus>,
    topic: String,
    policy: RetryPolicy,
    dead_letters: DeadLetterQueue<SerializedEvent>,
    held: Arc<Mutex<HashMap<StreamId, VecDeque<SerializedEvent>>>>,
    publishing: Arc<tokio::sync::Mutex<()>>,
    shutdown: watch::Receiver<bool>,
}

impl EventRelay {
    /// Create a relay.
    ///
    /// Returns the relay and a shutdown sender; send `true` to stop [`run`](Self::run)
    /// after a final drain.
    #[must_use]
    pub fn new(
        outbox: Arc<Outbox>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        policy: RetryPolicy,
        dead_letters: DeadLetterQueue<SerializedEvent>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = Self {
            outbox,
            bus,
            topic: topic.into(),
            policy,
            dead_letters,
            held: Arc::new(Mutex::new(HashMap::new())),
            publishing: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: shutdown_rx,
        };
        (relay, shutdown_tx)
    }

    /// Dead-letter queue shared with this relay.
    #[must_use]
    pub fn dead_letters(&self) -> DeadLetterQueue<SerializedEvent> {
        self.dead_letters.clone()
    }

    /// Events waiting behind a parked event of their request.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Publish everything currently in the outbox, oldest first.
    pub async fn drain_once(&self) -> RelayReport {
        let _publishing = self.publishing.lock().await;
        let mut report = RelayReport::default();

        while let Some(event) = self.outbox.pop() {
            let serialized = match event.to_serialized() {
                Ok(serialized) => serialized,
                Err(error) => {
                    tracing::error!(
                        event_id = %event.event_id,
                        request_id = %event.request_id,
                        %error,
                        "Dropping event that cannot be serialized"
                    );
                    metrics::counter!(names::EVENTS_PUBLISH_FAILED).increment(1);
                    report.unserializable += 1;
                    continue;
                },
            };

            let Some(serialized) = self.hold_if_blocked(serialized) else {
                report.held += 1;
                continue;
            };

            match self.publish(&serialized).await {
                Ok(()) => report.published += 1,
                Err(exhausted) => {
                    let error = exhausted.last_error.to_string();
                    if self.dead_letters.push(serialized, error, exhausted.attempts).is_err() {
                        tracing::error!(
                            event_id = %event.event_id,
                            request_id = %event.request_id,
                            max_size = self.dead_letters.max_size(),
                            "Dead letter queue full, pausing the relay"
                        );
                        self.outbox.requeue_front(event);
                        report.stalled = true;
                        break;
                    }
                    self.block(DomainEvent::stream_id(event.request_id));
                    report.dead_lettered += 1;
                },
            }
        }

        report
    }

    /// Publish parked events again, oldest first.
    ///
    /// When a parked event goes through, the events held behind it are
    /// published in order. An event that still fails goes back to the
    /// dead-letter queue and keeps its request blocked.
    pub async fn replay_dead_letters(&self) -> ReplayReport {
        let _publishing = self.publishing.lock().await;
        let mut report = ReplayReport::default();
        let mut still_failing = Vec::new();

        for letter in self.dead_letters.drain() {
            let stream = letter.payload.aggregate_id.clone();
            match self.publish(&letter.payload).await {
                Ok(()) => {
                    metrics::counter!(names::EVENTS_REPLAYED).increment(1);
                    report.replayed += 1;
                    report.released += self.release_held(&stream, &mut still_failing).await;
                },
                Err(exhausted) => still_failing.push(DeadLetter {
                    attempts: letter.attempts.saturating_add(exhausted.attempts),
                    error_message: exhausted.last_error.to_string(),
                    failed_at: Utc::now(),
                    payload: letter.payload,
                }),
            }
        }

        report.still_parked = still_failing.len();
        self.dead_letters.restore(still_failing);
        tracing::info!(
            replayed = report.replayed,
            released = report.released,
            still_parked = report.still_parked,
            "Dead letter replay finished"
        );
        report
    }

    /// Drain whenever events arrive until shutdown, then drain one last time.
    ///
    /// A stalled pass is retried after the policy's maximum backoff.
    pub async fn run(mut self) {
        tracing::info!(topic = %self.topic, "Event relay started");

        loop {
            let report = self.drain_once().await;
            if *self.shutdown.borrow() {
                break;
            }
            let pause = self.policy.max_delay;
            tokio::select! {
                () = self.outbox.notified() => {},
                () = tokio::time::sleep(pause), if report.stalled => {},
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        let report = self.drain_once().await;
        tracing::info!(
            topic = %self.topic,
            flushed = report.published,
            dead_lettered = report.dead_lettered,
            held = self.held_count(),
            left_in_outbox = self.outbox.len(),
            "Event relay stopped"
        );
    }

    async fn publish(&self, serialized: &SerializedEvent) -> Result<(), RetriesExhausted<EventBusError>> {
        let bus = &self.bus;
        let topic = self.topic.as_str();
        let result = retry_with_backoff(&self.policy, "publish_event", || bus.publish(topic, serialized)).await;

        match result {
            Ok(done) => {
                metrics::counter!(names::EVENTS_PUBLISHED, "event_type" => serialized.event_type.clone())
                    .increment(1);
                if done.attempts > 1 {
                    metrics::counter!(names::EVENTS_PUBLISH_RETRIES).increment(u64::from(done.attempts - 1));
                }
                tracing::debug!(
                    event_id = %serialized.event_id(),
                    event_type = %serialized.event_type,
                    aggregate_id = %serialized.aggregate_id,
                    sequence = serialized.sequence,
                    attempts = done.attempts,
                    "Event published"
                );
                Ok(())
            },
            Err(exhausted) => {
                metrics::counter!(names::EVENTS_PUBLISH_FAILED).increment(1);
                metrics::counter!(names::EVENTS_PUBLISH_RETRIES)
                    .increment(u64::from(exhausted.attempts.saturating_sub(1)));
                tracing::error!(
                    event_id = %serialized.event_id(),
                    event_type = %serialized.event_type,
                    aggregate_id = %serialized.aggregate_id,
                    sequence = serialized.sequence,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Event publish failed"
                );
                Err(exhausted)
            },
        }
    }

    /// Keep `event` back if its request is blocked; otherwise hand it back.
    fn hold_if_blocked(&self, event: SerializedEvent) -> Option<SerializedEvent> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(waiting) = held.get_mut(&event.aggregate_id) else {
            return Some(event);
        };
        metrics::counter!(names::EVENTS_HELD).increment(1);
        tracing::warn!(
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            "Holding event behind a dead-lettered predecessor"
        );
        waiting.push_back(event);
        None
    }

    fn block(&self, stream: StreamId) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream)
            .or_default();
    }

    /// Publish the events held for `stream`. Unblocks the stream when all of
    /// them went out; otherwise the failing one joins `still_failing`.
    async fn release_held(&self, stream: &StreamId, still_failing: &mut Vec<DeadLetter<SerializedEvent>>) -> usize {
        let mut released = 0;
        loop {
            let next = {
                let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
                let next = held.get_mut(stream).and_then(VecDeque::pop_front);
                if next.is_none() {
                    held.remove(stream);
                }
                next
            };
            let Some(event) = next else {
                return released;
            };

            match self.publish(&event).await {
                Ok(()) => released += 1,
                Err(exhausted) => {
                    still_failing.push(DeadLetter {
                        attempts: exhausted.attempts,
                        error_message: exhausted.last_error.to_string(),
                        failed_at: Utc::now(),
                        payload: event,
                    });
                    return released;
                },
            }
        }
    }
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("topic", &self.topic)
            .field("policy", &self.policy)
            .field("pending", &self.outbox.len())
            .field("held", &self.held_count())
            .finish_non_exhaustive()
    }
}
