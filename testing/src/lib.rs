//! # Benefits Testing
//!
//! Test doubles and harnesses for the benefit request workflow:
//!
//! - [`FixedClock`] / [`test_clock`] for deterministic timestamps
//! - [`InMemoryEventBus`] with publish-failure injection
//! - [`ReducerTest`] for given/when/then reducer tests
//!
//! ## Example
//!
//! ```ignore
//! use benefits_testing::{InMemoryEventBus, test_clock};
//!
//! #[tokio::test]
//! async fn relay_retries() {
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     bus.fail_next(2);
//!     // ... drive the relay, then inspect bus.published()
//! }
//! ```

use benefits_core::environment::Clock;
use chrono::{DateTime, Utc};


pub use mocks::{FixedClock, InMemoryEventBus, test_clock};
pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use benefits_core::event::SerializedEvent;
    use benefits_core::event_bus::{EventBus, EventBusError, EventStream};
    use futures::stream::{self, StreamExt};
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};
    use tokio::sync::broadcast;

    /// Clock frozen at one instant.
    ///
    /// ```
    /// use benefits_testing::mocks::FixedClock;
    /// use benefits_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a clock that always reports `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Default test clock: 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }

    const TOPIC_BUFFER: usize = 1024;

    /// Broadcast-backed event bus for tests.
    ///
    /// Every accepted publish is recorded and can be inspected with
    /// [`published`](Self::published). [`fail_next`](Self::fail_next) makes
    /// the next `n` publishes fail, which is how relay retry paths are tested.
    pub struct InMemoryEventBus {
        topics: Mutex<HashMap<String, broadcast::Sender<SerializedEvent>>>,
        published: Mutex<Vec<(String, SerializedEvent)>>,
        failures_pending: AtomicU32,
    }

    impl InMemoryEventBus {
        /// Create a bus buffering up to 1024 events per topic.
        #[must_use]
        pub fn new() -> Self {
            Self {
                topics: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                failures_pending: AtomicU32::new(0),
            }
        }

        /// Make the next `n` publishes fail.
        pub fn fail_next(&self, n: u32) {
            self.failures_pending.store(n, Ordering::SeqCst);
        }

        /// Events accepted so far, in publish order.
        #[must_use]
        pub fn published(&self) -> Vec<(String, SerializedEvent)> {
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Type tags of accepted events on `topic`, in publish order.
        #[must_use]
        pub fn published_types(&self, topic: &str) -> Vec<String> {
            self.published()
                .into_iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, event)| event.event_type)
                .collect()
        }

        fn sender(&self, topic: &str) -> broadcast::Sender<SerializedEvent> {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
                .clone()
        }

        fn take_failure(&self) -> bool {
            self.failures_pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Default for InMemoryEventBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventBus for InMemoryEventBus {
        fn publish(
            &self,
            topic: &str,
            event: &SerializedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            let topic = topic.to_string();
            let event = event.clone();

            Box::pin(async move {
                if topic.is_empty() {
                    return Err(EventBusError::InvalidTopic(topic));
                }
                if self.take_failure() {
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: "injected failure".to_string(),
                    });
                }

                self.published
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((topic.clone(), event.clone()));

                // No subscribers is not an error; the event is still recorded.
                let _ = self.sender(&topic).send(event);
                Ok(())
            })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();

            Box::pin(async move {
                if topics.is_empty() || topics.iter().any(String::is_empty) {
                    return Err(EventBusError::SubscriptionFailed {
                        topics,
                        reason: "topic list must be non-empty".to_string(),
                    });
                }

                let streams = topics.iter().map(|topic| {
                    let mut rx = self.sender(topic).subscribe();
                    Box::pin(async_stream::stream! {
                        loop {
                            match rx.recv().await {
                                Ok(event) => yield Ok(event),
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    yield Err(EventBusError::Lagged { skipped });
                                },
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    })
                });

                Ok(stream::select_all(streams).boxed())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)] // Test code

    use super::*;
    use benefits_core::event::{EventMetadata, SerializedEvent};
    use benefits_core::event_bus::{EventBus, EventBusError};
    use benefits_core::stream::StreamId;
    use futures::StreamExt;

    fn event(event_type: &str, sequence: u64) -> SerializedEvent {
        SerializedEvent {
            event_type: event_type.to_string(),
            aggregate_id: StreamId::new("request-1"),
            sequence,
            data: vec![1, 2, 3],
            metadata: EventMetadata::new(test_clock().now()),
        }
    }

    #[test]
    fn test_clock_is_new_year_2025() {
        assert_eq!(test_clock().now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["requests"]).await.unwrap();

        bus.publish("requests", &event("RequestCreated", 1)).await.unwrap();
        bus.publish("requests", &event("RequestSubmitted", 2)).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.event_type, "RequestSubmitted");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_publish() {
        let bus = InMemoryEventBus::new();
        bus.fail_next(2);

        assert!(matches!(
            bus.publish("requests", &event("A", 1)).await,
            Err(EventBusError::PublishFailed { .. })
        ));
        assert!(bus.publish("requests", &event("A", 1)).await.is_err());
        assert!(bus.publish("requests", &event("A", 1)).await.is_ok());

        assert_eq!(bus.published_types("requests"), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        bus.publish("one", &event("A", 1)).await.unwrap();
        bus.publish("two", &event("B", 1)).await.unwrap();

        assert_eq!(bus.published_types("one"), vec!["A".to_string()]);
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn empty_subscription_is_rejected() {
        let bus = InMemoryEventBus::new();
        assert!(bus.subscribe(&[]).await.is_err());
    }
}
