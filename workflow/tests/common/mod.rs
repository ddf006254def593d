//! Shared fixtures for the workflow integration tests.

#![allow(dead_code)] // Not every test binary uses every fixture
#![allow(clippy::unwrap_used, clippy::expect_used)]

use benefits_core::stream::Version;
use benefits_testing::test_clock;
use benefits_workflow::aggregate::NewRequest;
use benefits_workflow::audit::{AuditRecorder, AuditSigner, HmacAuditSigner, InMemoryAuditLog};
use benefits_workflow::documents::StaticDocumentRequirements;
use benefits_workflow::outbox::Outbox;
use benefits_workflow::payments::InMemoryPaymentChannels;
use benefits_workflow::route::{InMemoryWorkflowConfig, WorkflowGate};
use benefits_workflow::service::{RequestService, WorkflowEnvironment};
use benefits_workflow::types::{
    Actor, ActorContext, Beneficiary, BenefitType, CitizenId, DocumentType, Kinship, Origin, PaymentChannel,
    PaymentDetails, PaymentMethod, RequestId, RequesterInfo, Role, UnitId, UserId,
};
use chrono::NaiveDate;
use std::sync::Arc;

/// Triage, technical review and board approval; two mandatory documents.
pub const BIRTH_ALLOWANCE: &str = "birth_allowance";
/// No triage, a single approval gate, no mandatory documents.
pub const FOOD_BASKET: &str = "food_basket";

pub const BIRTH_DOCUMENTS: [&str; 2] = ["birth_certificate", "proof_of_address"];

pub struct Harness {
    pub service: Arc<RequestService>,
    pub payments: Arc<InMemoryPaymentChannels>,
    pub routes: Arc<InMemoryWorkflowConfig>,
    pub audit_log: Arc<InMemoryAuditLog>,
    pub outbox: Arc<Outbox>,
    pub unit: UnitId,
    pub technician: ActorContext,
    pub reviewer: ActorContext,
    pub manager: ActorContext,
    pub admin: ActorContext,
}

pub fn harness() -> Harness {
    harness_with_signer(Arc::new(HmacAuditSigner::new("audit-key-1", "test-signing-key")))
}

pub fn harness_with_signer(signer: Arc<dyn AuditSigner>) -> Harness {
    let routes = Arc::new(
        InMemoryWorkflowConfig::new()
            .with_route(
                BIRTH_ALLOWANCE,
                vec![
                    WorkflowGate::triage("reception", [Role::UnitTechnician]),
                    WorkflowGate::approval("technical", [Role::TechnicalReviewer]),
                    WorkflowGate::approval("board", [Role::Manager]),
                ],
            )
            .unwrap()
            .with_route(FOOD_BASKET, vec![WorkflowGate::approval("technical", [Role::TechnicalReviewer])])
            .unwrap(),
    );
    let payments = Arc::new(InMemoryPaymentChannels::new());
    let audit_log = Arc::new(InMemoryAuditLog::new());
    let outbox = Arc::new(Outbox::new());

    let env = WorkflowEnvironment {
        routes: routes.clone(),
        documents: Arc::new(StaticDocumentRequirements::new().require(BIRTH_ALLOWANCE, BIRTH_DOCUMENTS)),
        payments: payments.clone(),
        clock: Arc::new(test_clock()),
    };
    let audit = AuditRecorder::new(audit_log.clone(), signer).unwrap();
    let service = Arc::new(RequestService::new(env, audit, outbox.clone()));

    let unit = UnitId::new();
    Harness {
        service,
        payments,
        routes,
        audit_log,
        outbox,
        unit,
        technician: actor(unit, &[Role::UnitTechnician]),
        reviewer: actor(unit, &[Role::TechnicalReviewer]),
        manager: actor(unit, &[Role::Manager]),
        admin: actor(unit, &[Role::Admin]),
    }
}

pub fn actor(unit: UnitId, roles: &[Role]) -> ActorContext {
    ActorContext::new(Actor::new(UserId::new(), roles.iter().copied(), unit))
}

/// Newborn (born a month before the test clock) represented by the mother.
pub fn newborn_request(benefit_type: &str) -> NewRequest {
    NewRequest {
        beneficiary: Beneficiary {
            citizen_id: CitizenId::new(),
            name: "Newborn".to_string(),
            birth_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
        },
        requester: RequesterInfo {
            citizen_id: CitizenId::new(),
            kinship: Some(Kinship::Mother),
        },
        benefit_type: BenefitType::new(benefit_type),
        origin: Origin::InPerson,
    }
}

pub fn payment() -> PaymentDetails {
    PaymentDetails {
        amount_cents: 50_000,
        method: PaymentMethod::Pix,
        reference: Some("batch-1".to_string()),
    }
}

impl Harness {
    /// Create a request created by the technician, with a registered PIX key.
    pub async fn create(&self, benefit_type: &str) -> (RequestId, Version) {
        let new = newborn_request(benefit_type);
        self.payments.register(
            new.beneficiary.citizen_id,
            PaymentChannel::Pix {
                key: "mother@example.org".to_string(),
            },
        );
        let outcome = self.service.create(&self.technician, new).await.unwrap();
        (outcome.request.id(), outcome.request.version())
    }

    /// Attach the mandatory documents, submit and finish triage.
    pub async fn into_analysis(&self, id: RequestId, mut version: Version) -> Version {
        for document in BIRTH_DOCUMENTS {
            version = self
                .service
                .attach_document(&self.technician, id, version, DocumentType::new(document))
                .await
                .unwrap()
                .request
                .version();
        }
        version = self.service.submit(&self.technician, id, version).await.unwrap().request.version();
        self.service
            .send_to_analysis(&self.technician, id, version)
            .await
            .unwrap()
            .request
            .version()
    }

    pub async fn opinion(&self, id: RequestId, version: Version) -> Version {
        self.service
            .record_technical_opinion(&self.reviewer, id, version, "eligible")
            .await
            .unwrap()
            .request
            .version()
    }
}
