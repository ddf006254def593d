//! Request service: the transaction boundary around the aggregate.
//!
//! A mutating call locks the request's slot, checks the caller's expected
//! version, applies the aggregate operation to a copy, records the audit entry
//! and only then writes the copy back and enqueues the events. Any failure
//! before the write-back leaves the stored request as it was.

use crate::aggregate::{BenefitRequest, Emitted, NewRequest, OperationContext, ReviewDecision, StatusHistoryEntry};
use crate::audit::{AuditDraft, AuditEntry, AuditError, AuditRecorder, ChainVerification, FieldChange, VerificationOutcome};
use crate::documents::DocumentRequirementChecker;
use crate::error::{RequestError, Result};
use crate::events::DomainEvent;
use crate::outbox::Outbox;
use crate::payments::PaymentChannelProvider;
use crate::repository::RequestRepository;
use crate::route::WorkflowConfigResolver;
use crate::types::{ActorContext, AuditEntryId, DocumentType, PaymentDetails, PendencyId, RequestId};
use benefits_core::environment::Clock;
use benefits_core::stream::Version;
use benefits_runtime::metrics::names;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Audit subject type of benefit requests.
pub const SUBJECT_TYPE: &str = "benefit_request";

/// Fields left out of audit diffs; history growth shows up as the status change.
const UNAUDITED_FIELDS: &[&str] = &["history"];

/// Collaborators consulted by request operations.
#[derive(Clone)]
pub struct WorkflowEnvironment {
    /// Route lookup, used at creation
    pub routes: Arc<dyn WorkflowConfigResolver>,
    /// Mandatory document check, used at submission
    pub documents: Arc<dyn DocumentRequirementChecker>,
    /// Payment channel lookup, used at release
    pub payments: Arc<dyn PaymentChannelProvider>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// New state and emitted events of a successful operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationOutcome {
    /// Request after the operation
    pub request: BenefitRequest,
    /// Events the operation emitted, in order
    pub events: Vec<DomainEvent>,
}

/// Entry point for request operations.
pub struct RequestService {
    env: WorkflowEnvironment,
    repository: RequestRepository,
    audit: AuditRecorder,
    outbox: Arc<Outbox>,
}

impl RequestService {
    /// Create a service with an empty repository.
    #[must_use]
    pub fn new(env: WorkflowEnvironment, audit: AuditRecorder, outbox: Arc<Outbox>) -> Self {
        Self {
            env,
            repository: RequestRepository::new(),
            audit,
            outbox,
        }
    }

    /// Outbox the service writes to.
    #[must_use]
    pub fn outbox(&self) -> Arc<Outbox> {
        Arc::clone(&self.outbox)
    }

    /// Create a request in `Draft`.
    ///
    /// # Errors
    ///
    /// [`RequestError::ConfigurationMissing`], role denials or storage faults.
    #[tracing::instrument(
        name = "create_request",
        skip_all,
        fields(
            benefit_type = %new.benefit_type,
            correlation_id = %ctx.correlation_id,
            user_id = %ctx.actor.user_id,
        )
    )]
    pub async fn create(&self, ctx: &ActorContext, new: NewRequest) -> Result<OperationOutcome> {
        metrics::counter!(names::REQUESTS_OPERATIONS_TOTAL, "operation" => "create").increment(1);
        let result = self.create_inner(ctx, new);
        if let Err(error) = &result {
            record_rejection("create", error);
        }
        result
    }

    fn create_inner(&self, ctx: &ActorContext, new: NewRequest) -> Result<OperationOutcome> {
        let now = self.env.clock.now();
        let (request, events) = BenefitRequest::create(
            RequestId::new(),
            new,
            self.env.routes.as_ref(),
            OperationContext::new(ctx, now),
        )?;

        let changes = diff(&Value::Null, &to_value(&request)?);
        let draft = AuditDraft::new(SUBJECT_TYPE, request.id(), "create", ctx.clone(), now).with_changes(changes);
        self.audit.record(draft).map_err(storage)?;

        self.repository.insert(request.clone())?;
        self.outbox.enqueue(events.iter().cloned());

        tracing::info!(
            request_id = %request.id(),
            route_version = request.route().config_version,
            "Benefit request created"
        );
        Ok(OperationOutcome {
            request,
            events: events.into_vec(),
        })
    }

    /// Submit a draft.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::submit`], plus [`RequestError::NotFound`] and
    /// [`RequestError::ConcurrentModification`].
    pub async fn submit(&self, ctx: &ActorContext, id: RequestId, expected: Version) -> Result<OperationOutcome> {
        let documents = Arc::clone(&self.env.documents);
        self.execute(ctx, id, expected, "submit", move |request, op| {
            request.submit(op, documents.as_ref())
        })
        .await
    }

    /// Finish triage: `Open -> InAnalysis`.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::send_to_analysis`].
    pub async fn send_to_analysis(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "send_to_analysis", |request, op| {
            request.send_to_analysis(op)
        })
        .await
    }

    /// Record document metadata.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::attach_document`].
    pub async fn attach_document(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        document_type: DocumentType,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "attach_document", move |request, op| {
            request.attach_document(op, document_type)
        })
        .await
    }

    /// Record the technical opinion of the current cycle.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::record_technical_opinion`].
    pub async fn record_technical_opinion(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        text: &str,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "record_technical_opinion", |request, op| {
            request.record_technical_opinion(op, text)
        })
        .await
    }

    /// Apply a reviewer decision.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::review`].
    pub async fn review(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        decision: ReviewDecision,
    ) -> Result<OperationOutcome> {
        let operation = match &decision {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Pend { .. } => "pend",
            ReviewDecision::Reject { .. } => "reject",
        };
        self.execute(ctx, id, expected, operation, move |request, op| {
            request.review(op, decision)
        })
        .await
    }

    /// Resolve one pendency.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::resolve_pendency`].
    pub async fn resolve_pendency(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        pendency_id: PendencyId,
        note: &str,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "resolve_pendency", |request, op| {
            request.resolve_pendency(op, pendency_id, note)
        })
        .await
    }

    /// Send a request with every pendency resolved back to analysis.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::resubmit`].
    pub async fn resubmit(&self, ctx: &ActorContext, id: RequestId, expected: Version) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "resubmit", |request, op| request.resubmit(op))
            .await
    }

    /// Register the hand-over.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::release`].
    pub async fn release(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        payment: PaymentDetails,
    ) -> Result<OperationOutcome> {
        let payments = Arc::clone(&self.env.payments);
        self.execute(ctx, id, expected, "release", move |request, op| {
            request.release(op, payment, payments.as_ref())
        })
        .await
    }

    /// Confirm delivery.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::complete`].
    pub async fn complete(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        delivery_note: &str,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "complete", |request, op| {
            request.complete(op, delivery_note)
        })
        .await
    }

    /// Cancel a request.
    ///
    /// # Errors
    ///
    /// See [`BenefitRequest::cancel`].
    pub async fn cancel(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        reason: &str,
    ) -> Result<OperationOutcome> {
        self.execute(ctx, id, expected, "cancel", |request, op| request.cancel(op, reason))
            .await
    }

    /// Current snapshot of a request.
    ///
    /// # Errors
    ///
    /// [`RequestError::NotFound`].
    pub async fn get(&self, id: RequestId) -> Result<BenefitRequest> {
        self.repository.get(id).await.ok_or(RequestError::NotFound(id))
    }

    /// Status history, oldest first.
    ///
    /// # Errors
    ///
    /// [`RequestError::NotFound`].
    pub async fn get_history(&self, id: RequestId) -> Result<Vec<StatusHistoryEntry>> {
        Ok(self.get(id).await?.history().to_vec())
    }

    /// Audit entries of a request, oldest first.
    #[must_use]
    pub fn audit_trail(&self, id: RequestId) -> Vec<AuditEntry> {
        self.audit.trail(SUBJECT_TYPE, &id.to_string())
    }

    /// Check one audit entry against its seal.
    ///
    /// # Errors
    ///
    /// [`AuditError::EntryNotFound`].
    pub fn verify_audit(&self, entry_id: AuditEntryId) -> std::result::Result<VerificationOutcome, AuditError> {
        self.audit.verify(entry_id)
    }

    /// Check the audit hash chain.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] if an entry cannot be hashed.
    pub fn verify_audit_chain(&self) -> std::result::Result<ChainVerification, AuditError> {
        self.audit.verify_chain()
    }

    #[tracing::instrument(
        name = "request_operation",
        skip_all,
        fields(
            operation,
            request_id = %id,
            expected_version = %expected,
            correlation_id = %ctx.correlation_id,
            user_id = %ctx.actor.user_id,
        )
    )]
    async fn execute<F>(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        operation: &'static str,
        apply: F,
    ) -> Result<OperationOutcome>
    where
        F: FnOnce(&mut BenefitRequest, OperationContext<'_>) -> Result<Emitted>,
    {
        tracing::Span::current().record("operation", operation);
        metrics::counter!(names::REQUESTS_OPERATIONS_TOTAL, "operation" => operation).increment(1);

        let result = self.commit(ctx, id, expected, operation, apply).await;
        match &result {
            Ok(outcome) => tracing::info!(
                status = %outcome.request.status(),
                version = %outcome.request.version(),
                events = outcome.events.len(),
                "Operation committed"
            ),
            Err(error) => record_rejection(operation, error),
        }
        result
    }

    async fn commit<F>(
        &self,
        ctx: &ActorContext,
        id: RequestId,
        expected: Version,
        operation: &'static str,
        apply: F,
    ) -> Result<OperationOutcome>
    where
        F: FnOnce(&mut BenefitRequest, OperationContext<'_>) -> Result<Emitted>,
    {
        let slot = self.repository.slot(id).ok_or(RequestError::NotFound(id))?;
        let mut stored = slot.lock().await;
        stored.ensure_version(expected)?;

        let now = self.env.clock.now();
        let mut next = stored.clone();
        let events = apply(&mut next, OperationContext::new(ctx, now))?;

        let changes = diff(&to_value(&*stored)?, &to_value(&next)?);
        let draft = AuditDraft::new(SUBJECT_TYPE, id, operation, ctx.clone(), now).with_changes(changes);
        self.audit.record(draft).map_err(storage)?;

        *stored = next.clone();
        self.outbox.enqueue(events.iter().cloned());
        drop(stored);

        Ok(OperationOutcome {
            request: next,
            events: events.into_vec(),
        })
    }
}

impl std::fmt::Debug for RequestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestService")
            .field("requests", &self.repository.len())
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

fn record_rejection(operation: &'static str, error: &RequestError) {
    metrics::counter!(
        names::REQUESTS_OPERATIONS_REJECTED,
        "operation" => operation,
        "reason" => error.code()
    )
    .increment(1);

    match error {
        RequestError::ConcurrentModification { expected, actual, .. } => {
            metrics::counter!(names::REQUESTS_CONCURRENCY_CONFLICTS).increment(1);
            tracing::info!(%expected, %actual, "Operation lost a concurrent modification race");
        },
        RequestError::Storage(reason) => {
            tracing::error!(%reason, "Operation failed to persist");
        },
        other => {
            tracing::info!(reason = other.code(), error = %other, "Operation rejected");
        },
    }
}

fn storage(error: AuditError) -> RequestError {
    RequestError::Storage(error.to_string())
}

fn to_value(request: &BenefitRequest) -> Result<Value> {
    serde_json::to_value(request).map_err(|e| RequestError::Storage(e.to_string()))
}

/// Top-level field diff of two request snapshots.
fn diff(before: &Value, after: &Value) -> BTreeMap<String, FieldChange> {
    let empty = serde_json::Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    before
        .keys()
        .chain(after.keys())
        .filter(|field| !UNAUDITED_FIELDS.contains(&field.as_str()))
        .filter_map(|field| {
            let old = before.get(field).unwrap_or(&Value::Null);
            let new = after.get(field).unwrap_or(&Value::Null);
            (old != new).then(|| {
                (
                    field.clone(),
                    FieldChange {
                        before: old.clone(),
                        after: new.clone(),
                    },
                )
            })
        })
        .collect()
}
