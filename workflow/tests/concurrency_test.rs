//! Optimistic concurrency on a single request.
//!
//! Run with: `cargo test --test concurrency_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use benefits_workflow::error::RequestError;
use benefits_workflow::types::RequestStatus;
use common::{FOOD_BASKET, harness};

/// Two calls racing from the same version: one wins, the other must reload.
#[tokio::test]
async fn concurrent_cancel_and_submit_have_exactly_one_winner() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;

    let cancel = {
        let service = h.service.clone();
        let ctx = h.technician.clone();
        tokio::spawn(async move { service.cancel(&ctx, id, version, "Requested by family").await })
    };
    let submit = {
        let service = h.service.clone();
        let ctx = h.technician.clone();
        tokio::spawn(async move { service.submit(&ctx, id, version).await })
    };
    let (cancel, submit) = (cancel.await.unwrap(), submit.await.unwrap());

    let (winner, loser) = match (&cancel, &submit) {
        (Ok(_), Err(error)) => (RequestStatus::Cancelled, error),
        (Err(error), Ok(_)) => (RequestStatus::InAnalysis, error),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert!(matches!(
        loser,
        RequestError::ConcurrentModification { request_id, expected, .. } if *request_id == id && *expected == version
    ));

    let stored = h.service.get(id).await.unwrap();
    assert_eq!(stored.status(), winner);
    // Only the winner was audited.
    assert_eq!(h.service.audit_trail(id).len(), 2);
}

#[tokio::test]
async fn stale_version_is_rejected_after_reload_succeeds() {
    let h = harness();
    let (id, version) = h.create(FOOD_BASKET).await;
    let submitted = h.service.submit(&h.technician, id, version).await.unwrap();

    let error = h
        .service
        .cancel(&h.technician, id, version, "too late")
        .await
        .unwrap_err();
    assert!(matches!(error, RequestError::ConcurrentModification { .. }));
    assert!(error.is_user_error());

    let reloaded = h.service.get(id).await.unwrap();
    assert_eq!(reloaded.version(), submitted.request.version());
    let cancelled = h
        .service
        .cancel(&h.technician, id, reloaded.version(), "retry after reload")
        .await
        .unwrap();
    assert_eq!(cancelled.request.status(), RequestStatus::Cancelled);
}

#[tokio::test]
async fn writers_to_different_requests_do_not_conflict() {
    let h = harness();
    let mut requests = Vec::new();
    for _ in 0..8 {
        requests.push(h.create(FOOD_BASKET).await);
    }

    let tasks: Vec<_> = requests
        .iter()
        .map(|&(id, version)| {
            let service = h.service.clone();
            let ctx = h.technician.clone();
            tokio::spawn(async move { service.submit(&ctx, id, version).await })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.request.status(), RequestStatus::InAnalysis);
    }

    let chain = h.service.verify_audit_chain().unwrap();
    assert_eq!(
        chain,
        benefits_workflow::audit::ChainVerification::Intact { entries: 16 }
    );
}
