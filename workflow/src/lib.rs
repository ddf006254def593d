//! Benefit request workflow - the lifecycle core of municipal welfare requests
//!
//! A citizen (or a first-degree relative on behalf of a minor) asks for an
//! eventual benefit. The request walks a role-gated state machine whose
//! analysis path is pinned per benefit type at creation:
//!
//! ```text
//! Draft ──submit──▶ Open ──send_to_analysis──▶ InAnalysis ──approve (final gate)──▶ Approved
//!                                               │    ▲                                 │
//!                                           pend│    │resubmit                  release│
//!                                               ▼    │                                 ▼
//!                                              Pending                              Released
//!                                                                                      │
//!                                                                            complete │
//!        cancel: Draft | Open | InAnalysis | Pending | Approved ──▶ Cancelled          ▼
//!        reject: InAnalysis ──▶ Cancelled                                          Completed
//! ```
//!
//! # Architecture
//!
//! - [`aggregate::BenefitRequest`] owns the state and applies operations,
//!   consulting [`guard::decide`] before any mutation.
//! - [`service::RequestService`] is the transaction boundary: optimistic
//!   version check, one audit entry per operation, events to the [`outbox`].
//! - [`audit::AuditRecorder`] seals entries with HMAC-SHA256 (or a content
//!   hash when signing fails) and links them into a hash chain.
//! - [`outbox::EventRelay`] publishes committed events with retry, holding a
//!   request's later events back while an earlier one sits in the dead-letter
//!   queue; [`notifications::NotificationProjector`] consumes them, skipping
//!   redeliveries and delivering one request's notifications in order.
//!
//! # Example
//!
//! ```rust,ignore
//! let outcome = service.create(&ctx, new_request).await?;
//! let id = outcome.request.id();
//! let outcome = service.submit(&ctx, id, outcome.request.version()).await?;
//! ```

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod documents;
pub mod error;
pub mod events;
pub mod guard;
pub mod notifications;
pub mod outbox;
pub mod payments;
pub mod pendency;
pub mod repository;
pub mod route;
pub mod service;
pub mod types;

pub use aggregate::{BenefitRequest, NewRequest, ReviewDecision, StatusHistoryEntry};
pub use audit::{AuditRecorder, ChainVerification, HmacAuditSigner, InMemoryAuditLog, VerificationOutcome};
pub use config::WorkflowConfig;
pub use error::{BusinessRule, Denial, RequestError, Result};
pub use events::{DomainEvent, EVENT_TOPIC, RequestEvent};
pub use outbox::{EventRelay, Outbox};
pub use service::{OperationOutcome, RequestService, WorkflowEnvironment};
pub use types::{Actor, ActorContext, RequestId, RequestStatus, Role};
