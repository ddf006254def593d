//! The benefit request aggregate.
//!
//! [`BenefitRequest`] is the only type allowed to change request state. Every
//! operation follows the same shape: ask the guard, run the checks that need
//! collaborators, and only then mutate, append history and return the events
//! the operation declares. A refused operation leaves the request untouched.
//!
//! Version rule: the version advances once per appended history entry and
//! once per mutation that is not a transition (attachments, opinions, gate
//! approvals, pendency resolutions).

use crate::documents::DocumentRequirementChecker;
use crate::error::{Denial, RequestError, Result};
use crate::events::{DomainEvent, PendencySummary, RequestEvent};
use crate::guard::{self, Operation};
use crate::payments::PaymentChannelProvider;
use crate::pendency::{Pendencies, PendencyError};
use crate::route::{WorkflowConfigResolver, WorkflowGate, WorkflowRoute};
use crate::types::{
    Actor, ActorContext, Beneficiary, BenefitType, DocumentType, Origin, PaymentChannel,
    PaymentDetails, PendencyId, RequestId, RequestStatus, RequesterInfo, UserId,
};
use benefits_core::stream::Version;
use benefits_core::{SmallVec, smallvec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Events returned by one operation.
pub type Emitted = SmallVec<[DomainEvent; 2]>;

/// One status change. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    /// Status before
    pub from: RequestStatus,
    /// Status after
    pub to: RequestStatus,
    /// Operation that caused the change
    pub operation: String,
    /// Actor identity and roles at the time
    pub actor: Actor,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Justification, reason or note, when the operation takes one
    pub justification: Option<String>,
    /// Correlation id of the call
    pub correlation_id: Uuid,
}

/// Metadata of an attached document; the file itself lives elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDocument {
    /// Document type
    pub document_type: DocumentType,
    /// Who attached it
    pub attached_by: UserId,
    /// When
    pub attached_at: DateTime<Utc>,
}

/// Technical opinion for the current analysis cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalOpinion {
    /// Opinion text
    pub text: String,
    /// Reviewer
    pub author: UserId,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// A passed approval gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateApproval {
    /// Gate name
    pub gate: String,
    /// Approver
    pub approved_by: UserId,
    /// When
    pub approved_at: DateTime<Utc>,
}

/// Hand-over registered by the unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Payment details
    pub payment: PaymentDetails,
    /// Channel on record at release time
    pub channel: PaymentChannel,
    /// Releasing user
    pub released_by: UserId,
    /// When
    pub released_at: DateTime<Utc>,
}

/// Reviewer decision for [`BenefitRequest::review`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Pass the current approval gate
    Approve,
    /// Raise pendencies
    Pend {
        /// Why
        justification: String,
        /// One description per pendency
        items: Vec<String>,
    },
    /// Reject the request
    Reject {
        /// Why
        justification: String,
    },
}

/// Input of [`BenefitRequest::create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRequest {
    /// Beneficiary
    pub beneficiary: Beneficiary,
    /// Requester
    pub requester: RequesterInfo,
    /// Benefit type
    pub benefit_type: BenefitType,
    /// Intake channel
    pub origin: Origin,
}

/// Who is calling and when.
#[derive(Clone, Copy, Debug)]
pub struct OperationContext<'a> {
    /// Caller context
    pub actor: &'a ActorContext,
    /// Operation time
    pub now: DateTime<Utc>,
}

impl<'a> OperationContext<'a> {
    /// Bundle an actor context with the operation time.
    #[must_use]
    pub const fn new(actor: &'a ActorContext, now: DateTime<Utc>) -> Self {
        Self { actor, now }
    }

    const fn user_id(&self) -> UserId {
        self.actor.actor.user_id
    }
}

/// A benefit request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenefitRequest {
    pub(crate) id: RequestId,
    pub(crate) beneficiary: Beneficiary,
    pub(crate) requester: RequesterInfo,
    pub(crate) benefit_type: BenefitType,
    pub(crate) origin: Origin,
    pub(crate) status: RequestStatus,
    pub(crate) route: WorkflowRoute,
    pub(crate) history: Vec<StatusHistoryEntry>,
    pub(crate) pendencies: Pendencies,
    pub(crate) documents: Vec<AttachedDocument>,
    pub(crate) technical_opinion: Option<TechnicalOpinion>,
    pub(crate) gate_approvals: Vec<GateApproval>,
    pub(crate) release: Option<Release>,
    pub(crate) delivery_note: Option<String>,
    pub(crate) created_by: UserId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: Version,
    pub(crate) event_sequence: u64,
}

impl BenefitRequest {
    /// Create a request in `Draft`, pinning the current route of its benefit type.
    ///
    /// # Errors
    ///
    /// [`RequestError::ConfigurationMissing`] when no usable route exists, or a
    /// role denial when the actor holds no program role.
    pub fn create(
        id: RequestId,
        new: NewRequest,
        routes: &dyn WorkflowConfigResolver,
        ctx: OperationContext<'_>,
    ) -> Result<(Self, Emitted)> {
        guard::authorize_create(&ctx.actor.actor)?;
        let route = routes.resolve(&new.benefit_type).map_err(|error| {
            tracing::warn!(benefit_type = %new.benefit_type, %error, "No usable workflow route");
            RequestError::ConfigurationMissing(new.benefit_type.clone())
        })?;

        let mut request = Self {
            id,
            beneficiary: new.beneficiary,
            requester: new.requester,
            benefit_type: new.benefit_type,
            origin: new.origin,
            status: RequestStatus::Draft,
            route: route.pinned(ctx.now),
            history: Vec::new(),
            pendencies: Pendencies::default(),
            documents: Vec::new(),
            technical_opinion: None,
            gate_approvals: Vec::new(),
            release: None,
            delivery_note: None,
            created_by: ctx.user_id(),
            created_at: ctx.now,
            updated_at: ctx.now,
            version: Version::INITIAL,
            event_sequence: 0,
        };

        let created = RequestEvent::RequestCreated {
            benefit_type: request.benefit_type.clone(),
            beneficiary: request.beneficiary.clone(),
            requester: request.requester.clone(),
            origin: request.origin,
            route_version: request.route.config_version,
        };
        let event = request.emit(ctx, created);
        Ok((request, smallvec![event]))
    }

    /// Submit a draft: `Draft -> Open`, continuing to `InAnalysis` when the
    /// pinned route has no triage gate.
    ///
    /// # Errors
    ///
    /// Guard denials, [`RequestError::MissingDocuments`] and
    /// [`RequestError::InvalidRepresentative`].
    pub fn submit(
        &mut self,
        ctx: OperationContext<'_>,
        documents: &dyn DocumentRequirementChecker,
    ) -> Result<Emitted> {
        self.authorize(&Operation::Submit, ctx)?;

        let missing = documents.missing_documents(&self.benefit_type, &self.attached_document_types());
        if !missing.is_empty() {
            return Err(RequestError::MissingDocuments(missing));
        }
        self.check_representative(ctx.now)?;

        self.transition(ctx, RequestStatus::Open, "submit", None)?;
        if !self.route.has_triage() {
            self.transition(ctx, RequestStatus::InAnalysis, "submit", None)?;
        }
        let status = self.status;
        Ok(smallvec![self.emit(ctx, RequestEvent::RequestSubmitted { status })])
    }

    /// Triage done: `Open -> InAnalysis`. Emits nothing.
    ///
    /// # Errors
    ///
    /// Guard denials.
    pub fn send_to_analysis(&mut self, ctx: OperationContext<'_>) -> Result<Emitted> {
        self.authorize(&Operation::SendToAnalysis, ctx)?;
        self.transition(ctx, RequestStatus::InAnalysis, "send_to_analysis", None)?;
        Ok(Emitted::new())
    }

    /// Record document metadata.
    ///
    /// # Errors
    ///
    /// Guard denials.
    pub fn attach_document(
        &mut self,
        ctx: OperationContext<'_>,
        document_type: DocumentType,
    ) -> Result<Emitted> {
        self.authorize(&Operation::AttachDocument, ctx)?;
        self.documents.push(AttachedDocument {
            document_type,
            attached_by: ctx.user_id(),
            attached_at: ctx.now,
        });
        self.touch(ctx.now);
        Ok(Emitted::new())
    }

    /// Record (or replace) the technical opinion of the current cycle.
    ///
    /// # Errors
    ///
    /// Guard denials.
    pub fn record_technical_opinion(
        &mut self,
        ctx: OperationContext<'_>,
        text: &str,
    ) -> Result<Emitted> {
        self.authorize(&Operation::RecordOpinion { text }, ctx)?;
        self.technical_opinion = Some(TechnicalOpinion {
            text: text.to_string(),
            author: ctx.user_id(),
            recorded_at: ctx.now,
        });
        self.touch(ctx.now);
        Ok(Emitted::new())
    }

    /// Apply a reviewer decision.
    ///
    /// # Errors
    ///
    /// Whatever the chosen decision returns.
    pub fn review(&mut self, ctx: OperationContext<'_>, decision: ReviewDecision) -> Result<Emitted> {
        match decision {
            ReviewDecision::Approve => self.approve(ctx),
            ReviewDecision::Pend {
                justification,
                items,
            } => self.pend(ctx, &justification, items),
            ReviewDecision::Reject { justification } => self.reject(ctx, &justification),
        }
    }

    /// Pass the current approval gate; the final gate moves to `Approved`.
    ///
    /// # Errors
    ///
    /// Guard denials, including a missing technical opinion.
    pub fn approve(&mut self, ctx: OperationContext<'_>) -> Result<Emitted> {
        self.authorize(&Operation::Approve, ctx)?;

        let gate = self
            .current_approval_gate()
            .map_or_else(|| "approval".to_string(), |gate| gate.name.clone());
        self.gate_approvals.push(GateApproval {
            gate,
            approved_by: ctx.user_id(),
            approved_at: ctx.now,
        });

        if self.current_approval_gate().is_some() {
            self.touch(ctx.now);
            return Ok(Emitted::new());
        }

        self.transition(ctx, RequestStatus::Approved, "approve", None)?;
        let approved = RequestEvent::RequestApproved {
            approved_by: ctx.user_id(),
            gates: self.gate_approvals.iter().map(|a| a.gate.clone()).collect(),
        };
        Ok(smallvec![self.emit(ctx, approved)])
    }

    /// Raise pendencies and move to `Pending`, opening a new analysis cycle.
    ///
    /// # Errors
    ///
    /// Guard denials (no items, blank justification).
    pub fn pend(
        &mut self,
        ctx: OperationContext<'_>,
        justification: &str,
        items: Vec<String>,
    ) -> Result<Emitted> {
        self.authorize(
            &Operation::Pend {
                justification,
                items: &items,
            },
            ctx,
        )?;

        let pendencies: Vec<PendencySummary> = self
            .pendencies
            .raise_cycle(items, ctx.user_id(), ctx.now)
            .iter()
            .map(|item| PendencySummary {
                id: item.id,
                description: item.description.clone(),
            })
            .collect();
        let cycle = self.pendencies.cycle();
        self.gate_approvals.clear();
        self.technical_opinion = None;

        self.transition(ctx, RequestStatus::Pending, "pend", Some(justification))?;
        let pended = RequestEvent::RequestPended {
            justification: justification.to_string(),
            pendencies,
            cycle,
        };
        Ok(smallvec![self.emit(ctx, pended)])
    }

    /// Reject during analysis: `InAnalysis -> Cancelled`.
    ///
    /// # Errors
    ///
    /// Guard denials (blank justification).
    pub fn reject(&mut self, ctx: OperationContext<'_>, justification: &str) -> Result<Emitted> {
        self.authorize(&Operation::Reject { justification }, ctx)?;
        self.transition(ctx, RequestStatus::Cancelled, "reject", Some(justification))?;
        let rejected = RequestEvent::RequestRejected {
            justification: justification.to_string(),
        };
        Ok(smallvec![self.emit(ctx, rejected)])
    }

    /// Resolve one pendency. Not a transition; emits nothing.
    ///
    /// # Errors
    ///
    /// Guard denials, [`RequestError::PendencyNotFound`] and
    /// [`RequestError::PendencyAlreadyResolved`].
    pub fn resolve_pendency(
        &mut self,
        ctx: OperationContext<'_>,
        pendency_id: PendencyId,
        note: &str,
    ) -> Result<Emitted> {
        self.authorize(&Operation::ResolvePendency { note }, ctx)?;
        self.pendencies
            .resolve(pendency_id, ctx.user_id(), ctx.now, note)
            .map_err(|error| match error {
                PendencyError::NotFound(id) => RequestError::PendencyNotFound(id),
                PendencyError::AlreadyResolved(id) => RequestError::PendencyAlreadyResolved(id),
            })?;
        self.touch(ctx.now);
        Ok(Emitted::new())
    }

    /// Back to analysis once every pendency of the cycle is resolved.
    ///
    /// # Errors
    ///
    /// Guard denials, including open pendencies.
    pub fn resubmit(&mut self, ctx: OperationContext<'_>) -> Result<Emitted> {
        self.authorize(&Operation::Resubmit, ctx)?;
        self.transition(ctx, RequestStatus::InAnalysis, "resubmit", None)?;
        let cycle = self.pendencies.cycle();
        Ok(smallvec![self.emit(ctx, RequestEvent::RequestResubmitted { cycle })])
    }

    /// Register the hand-over: `Approved -> Released`.
    ///
    /// # Errors
    ///
    /// Guard denials and [`RequestError::PaymentInfoMissing`].
    pub fn release(
        &mut self,
        ctx: OperationContext<'_>,
        payment: PaymentDetails,
        payments: &dyn PaymentChannelProvider,
    ) -> Result<Emitted> {
        self.authorize(
            &Operation::Release {
                amount_cents: payment.amount_cents,
            },
            ctx,
        )?;
        let channel = payments
            .payment_channel(&self.beneficiary.citizen_id)
            .ok_or(RequestError::PaymentInfoMissing(self.beneficiary.citizen_id))?;

        self.release = Some(Release {
            payment: payment.clone(),
            channel: channel.clone(),
            released_by: ctx.user_id(),
            released_at: ctx.now,
        });
        self.transition(ctx, RequestStatus::Released, "release", None)?;
        Ok(smallvec![self.emit(ctx, RequestEvent::RequestReleased { payment, channel })])
    }

    /// Confirm delivery: `Released -> Completed`.
    ///
    /// # Errors
    ///
    /// Guard denials.
    pub fn complete(&mut self, ctx: OperationContext<'_>, delivery_note: &str) -> Result<Emitted> {
        self.authorize(&Operation::Complete { delivery_note }, ctx)?;
        self.delivery_note = Some(delivery_note.to_string());
        self.transition(ctx, RequestStatus::Completed, "complete", Some(delivery_note))?;
        let completed = RequestEvent::RequestCompleted {
            delivery_note: delivery_note.to_string(),
        };
        Ok(smallvec![self.emit(ctx, completed)])
    }

    /// Cancel from any non-terminal status except `Released`.
    ///
    /// # Errors
    ///
    /// Guard denials (blank reason, not owner and not Admin/Manager).
    pub fn cancel(&mut self, ctx: OperationContext<'_>, reason: &str) -> Result<Emitted> {
        self.authorize(&Operation::Cancel { reason }, ctx)?;
        let from = self.status;
        self.transition(ctx, RequestStatus::Cancelled, "cancel", Some(reason))?;
        let cancelled = RequestEvent::RequestCancelled {
            reason: reason.to_string(),
            from,
        };
        Ok(smallvec![self.emit(ctx, cancelled)])
    }

    /// Fail unless the stored version equals `expected`.
    ///
    /// # Errors
    ///
    /// [`RequestError::ConcurrentModification`] on mismatch.
    pub fn ensure_version(&self, expected: Version) -> Result<()> {
        if self.version == expected {
            Ok(())
        } else {
            Err(RequestError::ConcurrentModification {
                request_id: self.id,
                expected,
                actual: self.version,
            })
        }
    }

    /// Approval gate the request is waiting on during analysis.
    #[must_use]
    pub fn current_approval_gate(&self) -> Option<&WorkflowGate> {
        self.route.approval_gate(self.gate_approvals.len())
    }

    /// Document types attached so far.
    #[must_use]
    pub fn attached_document_types(&self) -> BTreeSet<DocumentType> {
        self.documents
            .iter()
            .map(|document| document.document_type.clone())
            .collect()
    }

    /// Identity.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> RequestStatus {
        self.status
    }

    /// Optimistic concurrency version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Status history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }

    /// Pinned route.
    #[must_use]
    pub const fn route(&self) -> &WorkflowRoute {
        &self.route
    }

    /// Pendencies of every cycle.
    #[must_use]
    pub const fn pendencies(&self) -> &Pendencies {
        &self.pendencies
    }

    /// Beneficiary.
    #[must_use]
    pub const fn beneficiary(&self) -> &Beneficiary {
        &self.beneficiary
    }

    /// Requester.
    #[must_use]
    pub const fn requester(&self) -> &RequesterInfo {
        &self.requester
    }

    /// Benefit type.
    #[must_use]
    pub const fn benefit_type(&self) -> &BenefitType {
        &self.benefit_type
    }

    /// Intake channel.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Attached document metadata.
    #[must_use]
    pub fn documents(&self) -> &[AttachedDocument] {
        &self.documents
    }

    /// Opinion of the current cycle.
    #[must_use]
    pub const fn technical_opinion(&self) -> Option<&TechnicalOpinion> {
        self.technical_opinion.as_ref()
    }

    /// Gates passed in the current cycle.
    #[must_use]
    pub fn gate_approvals(&self) -> &[GateApproval] {
        &self.gate_approvals
    }

    /// Hand-over, once released.
    #[must_use]
    pub const fn release_record(&self) -> Option<&Release> {
        self.release.as_ref()
    }

    /// Delivery confirmation, once completed.
    #[must_use]
    pub fn delivery_note(&self) -> Option<&str> {
        self.delivery_note.as_deref()
    }

    /// Owner (creator).
    #[must_use]
    pub const fn created_by(&self) -> UserId {
        self.created_by
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last mutation.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn authorize(&self, operation: &Operation<'_>, ctx: OperationContext<'_>) -> Result<()> {
        guard::decide(self.status, operation, &ctx.actor.actor, self)
            .into_result()
            .map_err(RequestError::from)
    }

    fn check_representative(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.beneficiary.is_minor_at(now) {
            return Ok(());
        }
        if self.requester.citizen_id == self.beneficiary.citizen_id {
            return Err(RequestError::InvalidRepresentative(
                "a minor beneficiary must be represented by a legal representative".to_string(),
            ));
        }
        match self.requester.kinship {
            Some(kinship) if kinship.is_first_degree() => Ok(()),
            Some(kinship) => Err(RequestError::InvalidRepresentative(format!(
                "{kinship:?} is not a first-degree legal representative"
            ))),
            None => Err(RequestError::InvalidRepresentative(
                "no kinship recorded for the requester of a minor".to_string(),
            )),
        }
    }

    fn transition(
        &mut self,
        ctx: OperationContext<'_>,
        to: RequestStatus,
        operation: &'static str,
        justification: Option<&str>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(guard_denial(self.status, operation));
        }
        self.history.push(StatusHistoryEntry {
            from: self.status,
            to,
            operation: operation.to_string(),
            actor: ctx.actor.actor.clone(),
            at: ctx.now,
            justification: justification.map(str::to_string),
            correlation_id: ctx.actor.correlation_id,
        });
        self.status = to;
        self.touch(ctx.now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version = self.version.next();
        self.updated_at = now;
    }

    fn emit(&mut self, ctx: OperationContext<'_>, payload: RequestEvent) -> DomainEvent {
        self.event_sequence += 1;
        DomainEvent {
            event_id: Uuid::new_v4(),
            request_id: self.id,
            sequence: self.event_sequence,
            correlation_id: ctx.actor.correlation_id,
            occurred_at: ctx.now,
            payload,
        }
    }
}

fn guard_denial(from: RequestStatus, operation: &'static str) -> RequestError {
    RequestError::from(Denial::InvalidTransition { from, operation })
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

    use super::*;
    use crate::documents::StaticDocumentRequirements;
    use crate::error::BusinessRule;
    use crate::payments::InMemoryPaymentChannels;
    use crate::route::{InMemoryWorkflowConfig, WorkflowGate};
    use crate::types::{CitizenId, Kinship, PaymentMethod, Role, UnitId};
    use chrono::NaiveDate;

    fn routes(with_triage: bool) -> InMemoryWorkflowConfig {
        let mut gates = Vec::new();
        if with_triage {
            gates.push(WorkflowGate::triage("reception", [Role::UnitTechnician]));
        }
        gates.push(WorkflowGate::approval("technical", [Role::TechnicalReviewer]));
        gates.push(WorkflowGate::approval("board", [Role::Manager]));
        InMemoryWorkflowConfig::new()
            .with_route("birth_allowance", gates)
            .unwrap()
    }

    fn ctx_for(roles: &[Role]) -> ActorContext {
        ActorContext::new(Actor::new(UserId::new(), roles.iter().copied(), UnitId::new()))
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089)
    }

    fn newborn_request() -> NewRequest {
        NewRequest {
            beneficiary: Beneficiary {
                citizen_id: CitizenId::new(),
                name: "Baby".to_string(),
                birth_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            },
            requester: RequesterInfo {
                citizen_id: CitizenId::new(),
                kinship: Some(Kinship::Mother),
            },
            benefit_type: BenefitType::new("birth_allowance"),
            origin: Origin::InPerson,
        }
    }

    fn create_with(new: NewRequest, with_triage: bool) -> BenefitRequest {
        let technician = ctx_for(&[Role::UnitTechnician]);
        BenefitRequest::create(
            RequestId::new(),
            new,
            &routes(with_triage),
            OperationContext::new(&technician, now()),
        )
        .unwrap()
        .0
    }

    pub(crate) fn draft_request() -> BenefitRequest {
        create_with(newborn_request(), true)
    }

    pub(crate) fn in_analysis_request() -> BenefitRequest {
        let mut request = draft_request();
        let technician = ctx_for(&[Role::UnitTechnician]);
        let ctx = OperationContext::new(&technician, now());
        request.submit(ctx, &StaticDocumentRequirements::new()).unwrap();
        request.send_to_analysis(ctx).unwrap();
        request
    }

    fn with_opinion(request: &mut BenefitRequest) {
        let reviewer = ctx_for(&[Role::TechnicalReviewer]);
        request
            .record_technical_opinion(OperationContext::new(&reviewer, now()), "eligible")
            .unwrap();
    }

    fn assert_history_is_valid_walk(request: &BenefitRequest) {
        let mut expected_from = RequestStatus::Draft;
        for entry in request.history() {
            assert_eq!(entry.from, expected_from);
            assert!(entry.from.can_transition_to(entry.to), "{} -> {}", entry.from, entry.to);
            expected_from = entry.to;
        }
        assert_eq!(expected_from, request.status());
    }

    #[test]
    fn create_pins_route_and_emits_created() {
        let technician = ctx_for(&[Role::UnitTechnician]);
        let config = routes(true);
        let (request, events) = BenefitRequest::create(
            RequestId::new(),
            newborn_request(),
            &config,
            OperationContext::new(&technician, now()),
        )
        .unwrap();

        assert_eq!(request.status(), RequestStatus::Draft);
        assert!(request.history().is_empty());
        assert_eq!(request.version(), Version::INITIAL);
        assert_eq!(request.route().pinned_at, Some(now()));
        assert_eq!(request.created_by(), technician.actor.user_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "RequestCreated");
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn create_without_route_is_configuration_missing() {
        let technician = ctx_for(&[Role::UnitTechnician]);
        let mut new = newborn_request();
        new.benefit_type = BenefitType::new("funeral_aid");
        let error = BenefitRequest::create(
            RequestId::new(),
            new,
            &routes(true),
            OperationContext::new(&technician, now()),
        )
        .unwrap_err();
        assert_eq!(error, RequestError::ConfigurationMissing(BenefitType::new("funeral_aid")));
    }

    #[test]
    fn later_route_edits_do_not_touch_pinned_route() {
        let technician = ctx_for(&[Role::UnitTechnician]);
        let config = routes(true);
        let (request, _) = BenefitRequest::create(
            RequestId::new(),
            newborn_request(),
            &config,
            OperationContext::new(&technician, now()),
        )
        .unwrap();

        config
            .configure(
                BenefitType::new("birth_allowance"),
                vec![WorkflowGate::approval("solo", [Role::Admin])],
            )
            .unwrap();

        assert_eq!(request.route().config_version, 1);
        assert_eq!(request.route().approval_gate_count(), 2);
        assert!(request.route().has_triage());
    }

    #[test]
    fn submit_stops_at_open_with_triage() {
        let mut request = draft_request();
        let technician = ctx_for(&[Role::UnitTechnician]);
        let events = request
            .submit(OperationContext::new(&technician, now()), &StaticDocumentRequirements::new())
            .unwrap();

        assert_eq!(request.status(), RequestStatus::Open);
        assert_eq!(request.history().len(), 1);
        assert_eq!(
            events[0].payload,
            RequestEvent::RequestSubmitted { status: RequestStatus::Open }
        );
    }

    #[test]
    fn submit_without_triage_lands_in_analysis() {
        let mut request = create_with(newborn_request(), false);
        let technician = ctx_for(&[Role::UnitTechnician]);
        let events = request
            .submit(OperationContext::new(&technician, now()), &StaticDocumentRequirements::new())
            .unwrap();

        assert_eq!(request.status(), RequestStatus::InAnalysis);
        assert_eq!(request.history().len(), 2);
        assert_eq!(request.version(), Version::new(2));
        assert_eq!(events.len(), 1);
        assert_history_is_valid_walk(&request);
    }

    #[test]
    fn submit_reports_missing_documents_and_leaves_draft() {
        let mut request = draft_request();
        let technician = ctx_for(&[Role::UnitTechnician]);
        let ctx = OperationContext::new(&technician, now());
        let checker = StaticDocumentRequirements::new().require("birth_allowance", ["responsibility_term"]);

        let before = request.clone();
        let error = request.submit(ctx, &checker).unwrap_err();
        assert_eq!(
            error,
            RequestError::MissingDocuments(vec![DocumentType::new("responsibility_term")])
        );
        assert_eq!(request, before);

        request.attach_document(ctx, DocumentType::new("responsibility_term")).unwrap();
        request.submit(ctx, &checker).unwrap();
        assert_eq!(request.status(), RequestStatus::Open);
    }

    #[test]
    fn minor_needs_first_degree_representative() {
        let technician = ctx_for(&[Role::UnitTechnician]);
        let ctx = OperationContext::new(&technician, now());

        let mut grandparent = newborn_request();
        grandparent.requester.kinship = Some(Kinship::Grandparent);
        let mut request = create_with(grandparent, true);
        assert!(matches!(
            request.submit(ctx, &StaticDocumentRequirements::new()),
            Err(RequestError::InvalidRepresentative(_))
        ));

        let mut self_filed = newborn_request();
        self_filed.requester.citizen_id = self_filed.beneficiary.citizen_id;
        let mut request = create_with(self_filed, true);
        assert!(matches!(
            request.submit(ctx, &StaticDocumentRequirements::new()),
            Err(RequestError::InvalidRepresentative(_))
        ));
    }

    #[test]
    fn adult_may_file_for_themselves() {
        let mut adult = newborn_request();
        adult.beneficiary.birth_date = NaiveDate::from_ymd_opt(1980, 1, 1).unwrap();
        adult.requester = RequesterInfo {
            citizen_id: adult.beneficiary.citizen_id,
            kinship: None,
        };
        let mut request = create_with(adult, true);
        let technician = ctx_for(&[Role::UnitTechnician]);
        request
            .submit(OperationContext::new(&technician, now()), &StaticDocumentRequirements::new())
            .unwrap();
        assert_eq!(request.status(), RequestStatus::Open);
    }

    #[test]
    fn approval_walks_gates_in_order() {
        let mut request = in_analysis_request();
        with_opinion(&mut request);

        let reviewer = ctx_for(&[Role::TechnicalReviewer]);
        let events = request.approve(OperationContext::new(&reviewer, now())).unwrap();
        assert!(events.is_empty());
        assert_eq!(request.status(), RequestStatus::InAnalysis);
        assert_eq!(request.current_approval_gate().unwrap().name, "board");

        // Reviewer cannot pass the board gate.
        assert!(request.approve(OperationContext::new(&reviewer, now())).is_err());

        let manager = ctx_for(&[Role::Manager]);
        let events = request.approve(OperationContext::new(&manager, now())).unwrap();
        assert_eq!(request.status(), RequestStatus::Approved);
        assert_eq!(
            events[0].payload,
            RequestEvent::RequestApproved {
                approved_by: manager.actor.user_id,
                gates: vec!["technical".to_string(), "board".to_string()],
            }
        );
    }

    #[test]
    fn pend_resets_cycle_and_resubmit_needs_all_resolved() {
        let mut request = in_analysis_request();
        with_opinion(&mut request);
        let reviewer = ctx_for(&[Role::TechnicalReviewer]);
        request.approve(OperationContext::new(&reviewer, now())).unwrap();

        let events = request
            .pend(
                OperationContext::new(&reviewer, now()),
                "documents unreadable",
                vec!["proof of address".to_string(), "birth certificate".to_string()],
            )
            .unwrap();
        assert_eq!(request.status(), RequestStatus::Pending);
        assert!(request.gate_approvals().is_empty());
        assert!(request.technical_opinion().is_none());
        let RequestEvent::RequestPended { pendencies, cycle, .. } = &events[0].payload else {
            panic!("expected RequestPended");
        };
        assert_eq!(*cycle, 1);
        assert_eq!(pendencies.len(), 2);

        let technician = ctx_for(&[Role::UnitTechnician]);
        let ctx = OperationContext::new(&technician, now());
        request.resolve_pendency(ctx, pendencies[0].id, "uploaded").unwrap();
        assert_eq!(request.status(), RequestStatus::Pending);
        assert_eq!(
            request.resubmit(ctx).unwrap_err(),
            RequestError::from(BusinessRule::OpenPendencies { count: 1 })
        );

        request.resolve_pendency(ctx, pendencies[1].id, "uploaded").unwrap();
        request.resubmit(ctx).unwrap();
        assert_eq!(request.status(), RequestStatus::InAnalysis);
        assert_eq!(request.current_approval_gate().unwrap().name, "technical");
    }

    #[test]
    fn resolving_twice_is_reported() {
        let mut request = in_analysis_request();
        let reviewer = ctx_for(&[Role::TechnicalReviewer]);
        let events = request
            .pend(OperationContext::new(&reviewer, now()), "x", vec!["a".to_string()])
            .unwrap();
        let RequestEvent::RequestPended { pendencies, .. } = &events[0].payload else {
            panic!("expected RequestPended");
        };
        let id = pendencies[0].id;

        let technician = ctx_for(&[Role::UnitTechnician]);
        let ctx = OperationContext::new(&technician, now());
        request.resolve_pendency(ctx, id, "done").unwrap();
        assert_eq!(
            request.resolve_pendency(ctx, id, "again").unwrap_err(),
            RequestError::PendencyAlreadyResolved(id)
        );
        let unknown = PendencyId::new();
        assert_eq!(
            request.resolve_pendency(ctx, unknown, "x").unwrap_err(),
            RequestError::PendencyNotFound(unknown)
        );
    }

    #[test]
    fn release_needs_payment_channel() {
        let mut request = in_analysis_request();
        with_opinion(&mut request);
        let admin = ctx_for(&[Role::Admin]);
        let ctx = OperationContext::new(&admin, now());
        request.approve(ctx).unwrap();
        request.approve(ctx).unwrap();
        assert_eq!(request.status(), RequestStatus::Approved);

        let payment = PaymentDetails {
            amount_cents: 60_000,
            method: PaymentMethod::Pix,
            reference: None,
        };
        let channels = InMemoryPaymentChannels::new();
        let citizen = request.beneficiary().citizen_id;
        assert_eq!(
            request.release(ctx, payment.clone(), &channels).unwrap_err(),
            RequestError::PaymentInfoMissing(citizen)
        );
        assert_eq!(request.status(), RequestStatus::Approved);

        channels.register(citizen, PaymentChannel::Pix { key: "mae@example.org".to_string() });
        let events = request.release(ctx, payment.clone(), &channels).unwrap();
        assert_eq!(request.status(), RequestStatus::Released);
        assert!(matches!(
            &events[0].payload,
            RequestEvent::RequestReleased { payment: p, .. } if *p == payment
        ));
    }

    #[test]
    fn reject_cancels_with_justification() {
        let mut request = in_analysis_request();
        let manager = ctx_for(&[Role::Manager]);
        let events = request
            .reject(OperationContext::new(&manager, now()), "income above threshold")
            .unwrap();
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert_eq!(
            request.history().last().unwrap().justification.as_deref(),
            Some("income above threshold")
        );
        assert_eq!(events[0].event_type(), "RequestRejected");
    }

    #[test]
    fn cancel_records_origin_status() {
        let mut request = draft_request();
        let manager = ctx_for(&[Role::Manager]);
        let events = request
            .cancel(OperationContext::new(&manager, now()), "filed twice")
            .unwrap();
        assert_eq!(
            events[0].payload,
            RequestEvent::RequestCancelled {
                reason: "filed twice".to_string(),
                from: RequestStatus::Draft,
            }
        );

        // Terminal: nothing else goes through.
        let error = request
            .cancel(OperationContext::new(&manager, now()), "again")
            .unwrap_err();
        assert_eq!(
            error,
            RequestError::Denied(Denial::InvalidTransition {
                from: RequestStatus::Cancelled,
                operation: "cancel"
            })
        );
    }

    #[test]
    fn role_denial_leaves_state_unchanged() {
        let mut request = draft_request();
        let reviewer = ctx_for(&[Role::TechnicalReviewer]);
        let before = request.clone();
        let error = request
            .submit(OperationContext::new(&reviewer, now()), &StaticDocumentRequirements::new())
            .unwrap_err();
        assert!(error.is_invalid_transition());
        assert_eq!(request, before);
    }

    #[test]
    fn ensure_version_reports_both_versions() {
        let request = draft_request();
        assert!(request.ensure_version(Version::INITIAL).is_ok());
        assert_eq!(
            request.ensure_version(Version::new(3)).unwrap_err(),
            RequestError::ConcurrentModification {
                request_id: request.id(),
                expected: Version::new(3),
                actual: Version::INITIAL,
            }
        );
    }
}
