//! End-to-end request lifecycles through the request service.
//!
//! Run with: `cargo test --test lifecycle_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use benefits_workflow::aggregate::ReviewDecision;
use benefits_workflow::audit::VerificationOutcome;
use benefits_workflow::error::{BusinessRule, Denial, RequestError};
use benefits_workflow::events::RequestEvent;
use benefits_workflow::service::SUBJECT_TYPE;
use benefits_workflow::types::{DocumentType, RequestStatus, Role};
use common::{BIRTH_ALLOWANCE, FOOD_BASKET, actor, harness, payment};

/// Full happy path with one pendency round.
#[tokio::test]
async fn birth_allowance_completes_after_one_pendency_round() {
    let h = harness();
    let (id, version) = h.create(BIRTH_ALLOWANCE).await;
    let mut version = h.into_analysis(id, version).await;
    version = h.opinion(id, version).await;

    // Pass the technical gate, then the board asks for a document.
    version = h
        .service
        .review(&h.reviewer, id, version, ReviewDecision::Approve)
        .await
        .unwrap()
        .request
        .version();
    let pended = h
        .service
        .review(
            &h.manager,
            id,
            version,
            ReviewDecision::Pend {
                justification: "Income proof is outdated".to_string(),
                items: vec!["Send a recent income statement".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(pended.request.status(), RequestStatus::Pending);
    assert!(pended.request.gate_approvals().is_empty());
    assert!(pended.request.technical_opinion().is_none());
    let pendency = pended.request.pendencies().items()[0].id;
    version = pended.request.version();

    version = h
        .service
        .resolve_pendency(&h.technician, id, version, pendency, "Statement attached")
        .await
        .unwrap()
        .request
        .version();
    version = h.service.resubmit(&h.technician, id, version).await.unwrap().request.version();

    // Second cycle starts from the first gate again.
    version = h.opinion(id, version).await;
    version = h
        .service
        .review(&h.reviewer, id, version, ReviewDecision::Approve)
        .await
        .unwrap()
        .request
        .version();
    let approved = h
        .service
        .review(&h.manager, id, version, ReviewDecision::Approve)
        .await
        .unwrap();
    assert_eq!(approved.request.status(), RequestStatus::Approved);
    assert!(matches!(
        &approved.events[0].payload,
        RequestEvent::RequestApproved { gates, .. } if gates == &["technical".to_string(), "board".to_string()]
    ));

    let released = h
        .service
        .release(&h.technician, id, approved.request.version(), payment())
        .await
        .unwrap();
    let completed = h
        .service
        .complete(&h.technician, id, released.request.version(), "Transfer confirmed")
        .await
        .unwrap();
    assert_eq!(completed.request.status(), RequestStatus::Completed);
    assert_eq!(completed.request.delivery_note(), Some("Transfer confirmed"));

    // History: submit, send_to_analysis, pend, resubmit, approve, release, complete.
    let history = h.service.get_history(id).await.unwrap();
    let walk: Vec<(RequestStatus, RequestStatus)> = history.iter().map(|e| (e.from, e.to)).collect();
    assert_eq!(
        walk,
        vec![
            (RequestStatus::Draft, RequestStatus::Open),
            (RequestStatus::Open, RequestStatus::InAnalysis),
            (RequestStatus::InAnalysis, RequestStatus::Pending),
            (RequestStatus::Pending, RequestStatus::InAnalysis),
            (RequestStatus::InAnalysis, RequestStatus::Approved),
            (RequestStatus::Approved, RequestStatus::Released),
            (RequestStatus::Released, RequestStatus::Completed),
        ]
    );
    assert_eq!(history[2].justification.as_deref(), Some("Income proof is outdated"));

    // One signed audit entry per operation, each verifiable.
    let trail = h.service.audit_trail(id);
    let actions: Vec<&str> = trail.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        actions,
        vec![
            "create",
            "attach_document",
            "attach_document",
            "submit",
            "send_to_analysis",
            "record_technical_opinion",
            "approve",
            "pend",
            "resolve_pendency",
            "resubmit",
            "record_technical_opinion",
            "approve",
            "approve",
            "release",
            "complete",
        ]
    );
    for entry in &trail {
        assert_eq!(entry.subject_type, SUBJECT_TYPE);
        assert_eq!(h.service.verify_audit(entry.id).unwrap(), VerificationOutcome::Valid);
    }

    // Status-changing audit entries line up one to one with history entries.
    let transitions: Vec<_> = trail
        .iter()
        .filter(|e| e.changes.get("status").is_some_and(|c| !c.before.is_null()))
        .collect();
    assert_eq!(transitions.len(), history.len());
    for (entry, transition) in transitions.iter().zip(&history) {
        assert_eq!(entry.action, transition.operation);
        assert_eq!(entry.actor.actor.user_id, transition.actor.user_id);
        assert_eq!(entry.actor.correlation_id, transition.correlation_id);
        let status = &entry.changes["status"];
        assert_eq!(status.before, serde_json::to_value(transition.from).unwrap());
        assert_eq!(status.after, serde_json::to_value(transition.to).unwrap());
    }

    // Exactly one release event, carrying the payment details.
    let releases: Vec<_> = h
        .outbox
        .pending()
        .into_iter()
        .filter(|e| matches!(e.payload, RequestEvent::RequestReleased { .. }))
        .collect();
    assert_eq!(releases.len(), 1);
    assert!(matches!(&releases[0].payload, RequestEvent::RequestReleased { payment: p, .. } if p == &payment()));
}

#[tokio::test]
async fn events_of_a_request_are_numbered_in_emission_order() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();
    h.service.cancel(&h.technician, id, version, "Family moved away").await.unwrap();

    let events = h.outbox.pending();
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["RequestCreated", "RequestSubmitted", "RequestCancelled"]);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(events.iter().all(|e| e.request_id == id));
}

#[tokio::test]
async fn submit_without_triage_lands_in_analysis() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;

    let outcome = h.service.submit(&h.technician, id, version).await.unwrap();
    assert_eq!(outcome.request.status(), RequestStatus::InAnalysis);
    assert_eq!(outcome.request.history().len(), 2);
    assert!(matches!(
        outcome.events.as_slice(),
        [event] if matches!(event.payload, RequestEvent::RequestSubmitted { status: RequestStatus::InAnalysis })
    ));
    assert_eq!(h.service.audit_trail(id).len(), 2);
}

#[tokio::test]
async fn missing_documents_block_submission_and_leave_draft_untouched() {
    let h = harness();
    let (id, version) = h.create(BIRTH_ALLOWANCE).await;
    let version = h
        .service
        .attach_document(&h.technician, id, version, DocumentType::new("birth_certificate"))
        .await
        .unwrap()
        .request
        .version();
    let before = h.service.get(id).await.unwrap();
    let audit_before = h.service.audit_trail(id).len();

    let error = h.service.submit(&h.technician, id, version).await.unwrap_err();
    assert_eq!(error, RequestError::MissingDocuments(vec![DocumentType::new("proof_of_address")]));
    assert!(error.is_user_error());

    assert_eq!(h.service.get(id).await.unwrap(), before);
    assert_eq!(h.service.audit_trail(id).len(), audit_before);
    assert!(h.service.get_history(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn role_denial_leaves_state_unchanged() {
    let h = harness();
    let (id, version) = h.create(BIRTH_ALLOWANCE).await;
    let version = h.into_analysis(id, version).await;
    let before = h.service.get(id).await.unwrap();

    // A technician cannot record the opinion, and a manager cannot pass the technical gate.
    let error = h
        .service
        .record_technical_opinion(&h.technician, id, version, "eligible")
        .await
        .unwrap_err();
    assert!(error.is_invalid_transition());
    let version = h.opinion(id, version).await;
    let error = h
        .service
        .review(&h.manager, id, version, ReviewDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RequestError::Denied(Denial::RoleNotPermitted { operation: "approve", ref required })
            if required.contains(&Role::TechnicalReviewer) && required.contains(&Role::Admin)
    ));

    let after = h.service.get(id).await.unwrap();
    assert_eq!(after.status(), before.status());
    assert_eq!(after.history(), before.history());
    assert_eq!(after.version(), version);
}

#[tokio::test]
async fn approval_needs_a_technical_opinion() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();

    let error = h
        .service
        .review(&h.reviewer, id, version, ReviewDecision::Approve)
        .await
        .unwrap_err();
    assert_eq!(
        error,
        RequestError::Denied(Denial::BusinessRuleViolation(BusinessRule::TechnicalOpinionRequired))
    );
}

#[tokio::test]
async fn resubmit_waits_for_every_pendency_of_the_cycle() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();

    let items: Vec<String> = (1..=3).map(|n| format!("Document {n}")).collect();
    let pended = h
        .service
        .review(
            &h.reviewer,
            id,
            version,
            ReviewDecision::Pend {
                justification: "Incomplete file".to_string(),
                items,
            },
        )
        .await
        .unwrap();
    let ids: Vec<_> = pended.request.pendencies().items().iter().map(|p| p.id).collect();
    let mut version = pended.request.version();

    // Resolve all but one.
    for pendency in &ids[..2] {
        version = h
            .service
            .resolve_pendency(&h.technician, id, version, *pendency, "done")
            .await
            .unwrap()
            .request
            .version();
    }
    let error = h.service.resubmit(&h.technician, id, version).await.unwrap_err();
    assert_eq!(
        error,
        RequestError::Denied(Denial::BusinessRuleViolation(BusinessRule::OpenPendencies { count: 1 }))
    );

    // Resolving twice is refused.
    let error = h
        .service
        .resolve_pendency(&h.technician, id, version, ids[0], "again")
        .await
        .unwrap_err();
    assert_eq!(error, RequestError::PendencyAlreadyResolved(ids[0]));

    version = h
        .service
        .resolve_pendency(&h.technician, id, version, ids[2], "done")
        .await
        .unwrap()
        .request
        .version();
    let resubmitted = h.service.resubmit(&h.technician, id, version).await.unwrap();
    assert_eq!(resubmitted.request.status(), RequestStatus::InAnalysis);
}

#[tokio::test]
async fn reject_requires_justification_and_cancels() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();

    let error = h
        .service
        .review(
            &h.reviewer,
            id,
            version,
            ReviewDecision::Reject {
                justification: "  ".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        error,
        RequestError::Denied(Denial::BusinessRuleViolation(BusinessRule::JustificationRequired))
    );

    let rejected = h
        .service
        .review(
            &h.reviewer,
            id,
            version,
            ReviewDecision::Reject {
                justification: "Income above threshold".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.request.status(), RequestStatus::Cancelled);
    assert!(rejected.request.status().is_terminal());
}

#[tokio::test]
async fn release_without_payment_channel_is_refused() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let request = h.service.get(id).await.unwrap();
    h.payments.remove(&request.beneficiary().citizen_id);

    let mut version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();
    version = h.opinion(id, version).await;
    version = h
        .service
        .review(&h.reviewer, id, version, ReviewDecision::Approve)
        .await
        .unwrap()
        .request
        .version();

    let error = h.service.release(&h.technician, id, version, payment()).await.unwrap_err();
    assert_eq!(error, RequestError::PaymentInfoMissing(request.beneficiary().citizen_id));
    assert_eq!(h.service.get(id).await.unwrap().status(), RequestStatus::Approved);
}

#[tokio::test]
async fn cancel_is_open_to_owner_and_managers_only() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;

    let stranger = actor(h.unit, &[Role::UnitTechnician]);
    let error = h.service.cancel(&stranger, id, version, "duplicate").await.unwrap_err();
    assert!(error.is_invalid_transition());

    let cancelled = h.service.cancel(&h.technician, id, version, "duplicate").await.unwrap();
    assert!(matches!(
        &cancelled.events[0].payload,
        RequestEvent::RequestCancelled { from: RequestStatus::Draft, .. }
    ));

    // Terminal: nothing else applies.
    let error = h
        .service
        .submit(&h.admin, id, cancelled.request.version())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RequestError::Denied(Denial::InvalidTransition { from: RequestStatus::Cancelled, .. })
    ));
}

#[tokio::test]
async fn unknown_benefit_type_is_a_configuration_error() {
    let h = harness();
    let error = h
        .service
        .create(&h.technician, common::newborn_request("housing_aid"))
        .await
        .unwrap_err();
    assert!(matches!(error, RequestError::ConfigurationMissing(ref bt) if bt.as_str() == "housing_aid"));
    assert!(h.audit_log.is_empty());
}

#[tokio::test]
async fn reconfiguring_a_route_does_not_affect_pinned_requests() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    h.routes
        .configure(
            FOOD_BASKET.into(),
            vec![
                benefits_workflow::route::WorkflowGate::approval("technical", [Role::TechnicalReviewer]),
                benefits_workflow::route::WorkflowGate::approval("board", [Role::Manager]),
            ],
        )
        .unwrap();

    let mut version = h.service.submit(&h.technician, id, version).await.unwrap().request.version();
    version = h.opinion(id, version).await;
    let approved = h
        .service
        .review(&h.reviewer, id, version, ReviewDecision::Approve)
        .await
        .unwrap();
    assert_eq!(approved.request.status(), RequestStatus::Approved);
    assert_eq!(approved.request.route().config_version, 1);

    let (newer, _) = h.create(FOOD_BASKET).await;
    assert_eq!(h.service.get(newer).await.unwrap().route().config_version, 2);
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let h = harness();
    let id = benefits_workflow::types::RequestId::new();
    let error = h
        .service
        .submit(&h.technician, id, benefits_core::stream::Version::INITIAL)
        .await
        .unwrap_err();
    assert_eq!(error, RequestError::NotFound(id));
}
