//! Walks one birth-allowance request through its whole lifecycle.
//!
//! Runs in-process: in-memory stores, the in-memory event bus, the outbox
//! relay and a logging notification projector. Configuration comes from the
//! environment (and `.env`), see [`WorkflowConfig`].

use anyhow::Context;
use benefits_core::environment::SystemClock;
use benefits_core::event_bus::EventBus;
use benefits_runtime::DeadLetterQueue;
use benefits_runtime::metrics::MetricsServer;
use benefits_testing::InMemoryEventBus;
use benefits_workflow::aggregate::{NewRequest, ReviewDecision};
use benefits_workflow::audit::{AuditRecorder, InMemoryAuditLog, VerificationOutcome};
use benefits_workflow::config::WorkflowConfig;
use benefits_workflow::documents::StaticDocumentRequirements;
use benefits_workflow::notifications::{LoggingSender, NotificationProjector};
use benefits_workflow::outbox::{EventRelay, Outbox};
use benefits_workflow::payments::InMemoryPaymentChannels;
use benefits_workflow::route::{InMemoryWorkflowConfig, WorkflowGate};
use benefits_workflow::service::{RequestService, WorkflowEnvironment};
use benefits_workflow::types::{
    Actor, ActorContext, Beneficiary, BenefitType, CitizenId, DocumentType, Kinship, Origin, PaymentChannel,
    PaymentDetails, PaymentMethod, RequesterInfo, Role, UnitId, UserId,
};
use chrono::{Months, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BIRTH_ALLOWANCE: &str = "birth_allowance";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkflowConfig::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("invalid configuration")?;
    info!(topic = %config.events.topic, key_id = %config.audit.key_id, "Configuration loaded");

    let mut metrics_server = None;
    if config.observability.metrics_enabled {
        let server = MetricsServer::new(config.metrics_addr()?);
        server.start()?;
        metrics_server = Some(server);
    }

    // Collaborators
    let routes = InMemoryWorkflowConfig::new().with_route(
        BIRTH_ALLOWANCE,
        vec![
            WorkflowGate::triage("reception", [Role::UnitTechnician]),
            WorkflowGate::approval("technical", [Role::TechnicalReviewer]),
            WorkflowGate::approval("board", [Role::Manager]),
        ],
    )?;
    let documents = StaticDocumentRequirements::new().require(BIRTH_ALLOWANCE, ["birth_certificate", "proof_of_address"]);
    let payments = Arc::new(InMemoryPaymentChannels::new());
    let env = WorkflowEnvironment {
        routes: Arc::new(routes),
        documents: Arc::new(documents),
        payments: payments.clone(),
        clock: Arc::new(SystemClock),
    };

    let audit = AuditRecorder::new(Arc::new(InMemoryAuditLog::new()), Arc::new(config.signer()))?;
    let outbox = Arc::new(Outbox::new());
    let service = RequestService::new(env, audit, outbox.clone());

    // Event delivery
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let (projector, stop_projector) =
        NotificationProjector::new(Arc::new(LoggingSender), bus.clone(), config.events.topic.clone());
    let notifications = projector.store();
    let projector_task = projector.start().await?;

    let (relay, stop_relay) = EventRelay::new(
        outbox,
        bus,
        config.events.topic.clone(),
        config.retry_policy(),
        DeadLetterQueue::new(config.events.dlq_max_size),
    );
    let dead_letters = relay.dead_letters();
    let relay_task = tokio::spawn(relay.clone().run());

    // Actors
    let unit = UnitId::new();
    let technician = ActorContext::new(Actor::new(UserId::new(), [Role::UnitTechnician], unit));
    let reviewer = ActorContext::new(Actor::new(UserId::new(), [Role::TechnicalReviewer], unit));
    let manager = ActorContext::new(Actor::new(UserId::new(), [Role::Manager], unit));

    let newborn = Beneficiary {
        citizen_id: CitizenId::new(),
        name: "Newborn".to_string(),
        birth_date: Utc::now()
            .date_naive()
            .checked_sub_months(Months::new(1))
            .context("birth date out of range")?,
    };
    payments.register(
        newborn.citizen_id,
        PaymentChannel::Pix {
            key: "mother@example.org".to_string(),
        },
    );

    // Lifecycle
    let outcome = service
        .create(
            &technician,
            NewRequest {
                beneficiary: newborn,
                requester: RequesterInfo {
                    citizen_id: CitizenId::new(),
                    kinship: Some(Kinship::Mother),
                },
                benefit_type: BenefitType::new(BIRTH_ALLOWANCE),
                origin: Origin::InPerson,
            },
        )
        .await?;
    let id = outcome.request.id();
    let mut version = outcome.request.version();

    for document in ["birth_certificate", "proof_of_address"] {
        version = service
            .attach_document(&technician, id, version, DocumentType::new(document))
            .await?
            .request
            .version();
    }
    version = service.submit(&technician, id, version).await?.request.version();
    version = service.send_to_analysis(&technician, id, version).await?.request.version();
    version = service
        .record_technical_opinion(&reviewer, id, version, "Family meets the income criteria")
        .await?
        .request
        .version();
    version = service
        .review(&reviewer, id, version, ReviewDecision::Approve)
        .await?
        .request
        .version();
    version = service
        .review(&manager, id, version, ReviewDecision::Approve)
        .await?
        .request
        .version();
    version = service
        .release(
            &technician,
            id,
            version,
            PaymentDetails {
                amount_cents: 50_000,
                method: PaymentMethod::Pix,
                reference: Some("birth-allowance-batch-1".to_string()),
            },
        )
        .await?
        .request
        .version();
    let outcome = service
        .complete(&technician, id, version, "Transfer confirmed by the bank")
        .await?;
    info!(request_id = %id, status = %outcome.request.status(), "Lifecycle finished");

    for entry in service.get_history(id).await? {
        info!(from = %entry.from, to = %entry.to, operation = %entry.operation, "History");
    }
    for entry in service.audit_trail(id) {
        let outcome = service.verify_audit(entry.id)?;
        info!(action = %entry.action, valid = outcome == VerificationOutcome::Valid, "Audit entry");
    }
    info!(chain = ?service.verify_audit_chain()?, "Audit chain verified");

    // Shutdown: flush the relay, then give the projector time to drain.
    stop_relay.send(true).ok();
    relay_task.await?;
    if !dead_letters.is_empty() {
        let replay = relay.replay_dead_letters().await;
        info!(replayed = replay.replayed, still_parked = replay.still_parked, "Dead letters replayed");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_projector.send(true).ok();
    projector_task.await?;

    let delivered = notifications.state(|s| s.delivered).await;
    info!(delivered, dead_lettered = dead_letters.len(), "Event delivery finished");
    notifications.shutdown(Duration::from_secs(5)).await?;

    if let Some(server) = metrics_server {
        info!(addr = %server.addr(), "Metrics were exposed during the run");
    }
    Ok(())
}
