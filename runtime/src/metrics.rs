//! Prometheus metrics for the workflow.
//!
//! Metric names live in [`names`] so emitters and the exporter agree on them.
//! Emitting code uses the `metrics` facade directly; without an installed
//! recorder the calls are no-ops, which is what tests rely on.
//!
//! # Example
//!
//! ```rust,no_run
//! use benefits_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Metric names emitted across the workspace.
pub mod names {
    /// Mutating request operations attempted, labelled by `operation`.
    pub const REQUESTS_OPERATIONS_TOTAL: &str = "requests.operations.total";
    /// Operations refused, labelled by `operation` and `reason`.
    pub const REQUESTS_OPERATIONS_REJECTED: &str = "requests.operations.rejected";
    /// Optimistic concurrency losers.
    pub const REQUESTS_CONCURRENCY_CONFLICTS: &str = "requests.concurrency_conflicts";
    /// Audit entries appended, labelled by `seal`.
    pub const AUDIT_ENTRIES_RECORDED: &str = "audit.entries.recorded";
    /// Audit entries stored under the fallback hash.
    pub const AUDIT_SIGNATURE_FAILURES: &str = "audit.signature_failures";
    /// Events accepted by the bus.
    pub const EVENTS_PUBLISHED: &str = "events.published";
    /// Extra publish attempts beyond the first.
    pub const EVENTS_PUBLISH_RETRIES: &str = "events.publish_retries";
    /// Events dead-lettered after the retry budget ran out.
    pub const EVENTS_PUBLISH_FAILED: &str = "events.publish_failed";
    /// Current dead-letter queue depth.
    pub const DLQ_SIZE: &str = "dlq.size";
    /// Entries refused because the dead-letter queue was full.
    pub const DLQ_REFUSED: &str = "dlq.refused";
    /// Events held back behind a dead-lettered event of the same request.
    pub const EVENTS_HELD: &str = "events.held";
    /// Dead-lettered events published on replay.
    pub const EVENTS_REPLAYED: &str = "events.replayed";
    /// Notifications handed to the sender successfully.
    pub const NOTIFICATIONS_DELIVERED: &str = "notifications.delivered";
    /// Redelivered events ignored by the projector.
    pub const NOTIFICATIONS_DUPLICATES_SKIPPED: &str = "notifications.duplicates_skipped";
    /// Actions processed by a store.
    pub const STORE_ACTIONS_TOTAL: &str = "store.actions.total";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the global recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus exporter serving `/metrics` over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built and
    /// [`MetricsError::Install`] if another global recorder is installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        describe_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics listener stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }
}

fn describe_metrics() {
    describe_counter!(names::REQUESTS_OPERATIONS_TOTAL, "Mutating request operations attempted");
    describe_counter!(names::REQUESTS_OPERATIONS_REJECTED, "Request operations refused with a typed reason");
    describe_counter!(names::REQUESTS_CONCURRENCY_CONFLICTS, "Operations that lost an optimistic concurrency race");
    describe_counter!(names::AUDIT_ENTRIES_RECORDED, "Audit entries appended");
    describe_counter!(names::AUDIT_SIGNATURE_FAILURES, "Audit entries stored unsigned because signing failed");
    describe_counter!(names::EVENTS_PUBLISHED, "Domain events published to the bus");
    describe_counter!(names::EVENTS_PUBLISH_RETRIES, "Publish retries after a transient bus failure");
    describe_counter!(names::EVENTS_PUBLISH_FAILED, "Domain events dead-lettered");
    describe_gauge!(names::DLQ_SIZE, "Entries waiting in the dead-letter queue");
    describe_counter!(names::DLQ_REFUSED, "Entries refused by a full dead-letter queue");
    describe_counter!(names::EVENTS_HELD, "Events held back behind a dead-lettered event of the same request");
    describe_counter!(names::EVENTS_REPLAYED, "Dead-lettered events published on replay");
    describe_counter!(names::NOTIFICATIONS_DELIVERED, "Notifications delivered");
    describe_counter!(names::NOTIFICATIONS_DUPLICATES_SKIPPED, "Redelivered events skipped by the notification projector");
    describe_counter!(names::STORE_ACTIONS_TOTAL, "Actions processed by reducer stores");
}
