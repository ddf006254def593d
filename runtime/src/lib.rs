//! # Benefits Runtime
//!
//! Runtime pieces shared by the workflow's asynchronous side:
//!
//! - **Store**: owns reducer state, runs reducers and executes their effects
//! - **Retry**: exponential backoff for transient failures ([`retry`])
//! - **Dead letter queue**: bounded parking lot for work that ran out of retries;
//!   a full queue refuses new entries instead of evicting old ones
//! - **Metrics**: Prometheus exporter and metric names ([`metrics`])
//!
//! ## Example
//!
//! ```ignore
//! use benefits_runtime::Store;
//!
//! let store = Store::new(NotificationState::default(), NotificationReducer, env);
//! let mut handle = store.send(NotificationAction::EventReceived { .. }).await?;
//! handle.wait().await;
//! let delivered = store.state(|s| s.delivered).await;
//! ```

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use error::StoreError;
pub use retry::RetryPolicy;
pub use store::{EffectHandle, Store};

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),
    }
}

/// Work that failed after exhausting its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed payload
    pub payload: T,

    /// Attempts made before giving up
    pub attempts: u32,

    /// Error from the last attempt
    pub error_message: String,

    /// When the payload was parked
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO of [`DeadLetter`]s.
///
/// When full, [`push`](Self::push) hands the payload back and the caller
/// must hold on to it. Clones share the same queue.
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create an empty queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Park a failed payload.
    ///
    /// # Errors
    ///
    /// Returns the payload unchanged when the queue is full.
    pub fn push(&self, payload: T, error_message: String, attempts: u32) -> Result<(), T> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            ::metrics::counter!(crate::metrics::names::DLQ_REFUSED).increment(1);
            tracing::warn!(max_size = self.max_size, "DLQ at capacity, refusing entry");
            return Err(payload);
        }

        queue.push_back(DeadLetter {
            payload,
            attempts,
            error_message,
            failed_at: Utc::now(),
        });

        #[allow(clippy::cast_precision_loss)]
        ::metrics::gauge!(crate::metrics::names::DLQ_SIZE).set(queue.len() as f64);

        tracing::warn!(attempts, queue_size = queue.len(), "Payload added to dead letter queue");
        Ok(())
    }

    /// Put entries taken with [`drain`](Self::drain) back in front, keeping
    /// their order. Capacity is not checked; they were already admitted.
    pub fn restore(&self, entries: Vec<DeadLetter<T>>) {
        if entries.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
        #[allow(clippy::cast_precision_loss)]
        ::metrics::gauge!(crate::metrics::names::DLQ_SIZE).set(queue.len() as f64);
    }

    /// Capacity of the queue.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current number of parked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every parked entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        ::metrics::gauge!(crate::metrics::names::DLQ_SIZE).set(0.0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Store module - the reducer runtime
pub mod store {
    use crate::StoreError;
    use benefits_core::{effect::Effect, reducer::Reducer};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{RwLock, watch};

    /// Waits for the effects started by one `send()` to finish.
    ///
    /// Actions fed back by those effects are reduced before the handle
    /// completes; effects they start in turn are not tracked.
    #[derive(Clone)]
    pub struct EffectHandle {
        pending: Arc<AtomicUsize>,
        completion: watch::Receiver<()>,
    }

    impl EffectHandle {
        fn new() -> (Self, EffectTracking) {
            let pending = Arc::new(AtomicUsize::new(0));
            let (tx, rx) = watch::channel(());
            (
                Self {
                    pending: Arc::clone(&pending),
                    completion: rx,
                },
                EffectTracking {
                    pending,
                    notifier: Arc::new(tx),
                },
            )
        }

        /// Wait until every tracked effect has completed.
        pub async fn wait(&mut self) {
            loop {
                self.completion.borrow_and_update();
                if self.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                if self.completion.changed().await.is_err() {
                    return;
                }
            }
        }

    }

    impl std::fmt::Debug for EffectHandle {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EffectHandle")
                .field("pending", &self.pending.load(Ordering::Acquire))
                .finish()
        }
    }

    #[derive(Clone)]
    struct EffectTracking {
        pending: Arc<AtomicUsize>,
        notifier: Arc<watch::Sender<()>>,
    }

    impl EffectTracking {
        fn begin(&self) -> TrackingGuard {
            self.pending.fetch_add(1, Ordering::AcqRel);
            TrackingGuard(self.clone())
        }
    }

    // Decrements on drop so a panicking effect still completes its handle.
    struct TrackingGuard(EffectTracking);

    impl Drop for TrackingGuard {
        fn drop(&mut self) {
            self.0.pending.fetch_sub(1, Ordering::AcqRel);
            let _ = self.0.notifier.send(());
        }
    }

    struct InFlightGuard(Arc<AtomicUsize>);

    impl Drop for InFlightGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Reducer runtime.
    ///
    /// Holds state behind a `tokio::sync::RwLock`; `send()` reduces under the
    /// write lock and spawns the returned effects. Actions produced by effects
    /// are fed back into the reducer.
    pub struct Store<S, A, E, R> {
        state: Arc<RwLock<S>>,
        reducer: Arc<R>,
        environment: Arc<E>,
        shutdown: Arc<AtomicBool>,
        in_flight: Arc<AtomicUsize>,
        _action: std::marker::PhantomData<fn(A)>,
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R> {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: Arc::clone(&self.reducer),
                environment: Arc::clone(&self.environment),
                shutdown: Arc::clone(&self.shutdown),
                in_flight: Arc::clone(&self.in_flight),
                _action: std::marker::PhantomData,
            }
        }
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a store.
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer: Arc::new(reducer),
                environment: Arc::new(environment),
                shutdown: Arc::new(AtomicBool::new(false)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                _action: std::marker::PhantomData,
            }
        }

        /// Reduce an action and start its effects.
        ///
        /// Returns once the reducer has run; effects continue in spawned
        /// tasks and can be awaited through the returned handle.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] after [`shutdown`](Self::shutdown).
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!(crate::metrics::names::STORE_ACTIONS_TOTAL).increment(1);

            let effects = {
                let mut state = self.state.write().await;
                self.reducer.reduce(&mut state, action, &self.environment)
            };

            let (handle, tracking) = EffectHandle::new();
            for effect in effects {
                if effect.is_none() {
                    continue;
                }
                let guard = tracking.begin();
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                let in_flight = InFlightGuard(Arc::clone(&self.in_flight));
                let store = self.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let _in_flight = in_flight;
                    store.run_effect(effect).await;
                });
            }

            Ok(handle)
        }

        /// Read state through a closure.
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        /// Stop accepting actions and wait for running effects.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
        /// when `timeout` elapses.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            self.shutdown.store(true, Ordering::Release);
            let deadline = tokio::time::Instant::now() + timeout;

            loop {
                let running = self.in_flight.load(Ordering::Acquire);
                if running == 0 {
                    tracing::info!("Store shut down cleanly");
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::error!(running, "Store shutdown timed out");
                    return Err(StoreError::ShutdownTimeout(running));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn feed_back(&self, action: A) {
            if let Err(error) = self.send(action).await {
                tracing::debug!(%error, "Dropped feedback action");
            }
        }

        fn run_effect(&self, effect: Effect<A>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
            let store = self.clone();
            Box::pin(async move {
                match effect {
                    Effect::None => {},
                    Effect::Future(fut) => {
                        metrics::counter!("store.effects.executed", "type" => "future").increment(1);
                        if let Some(action) = fut.await {
                            store.feed_back(action).await;
                        }
                    },
                }
            })
        }
    }
}
