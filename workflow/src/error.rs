//! Error types for benefit request operations.
//!
//! Every refused operation maps to a specific variant so callers can render
//! actionable feedback. Audit signing faults and event delivery faults never
//! show up here; they are handled where they happen.

use crate::types::{BenefitType, CitizenId, DocumentType, PendencyId, RequestId, RequestStatus, Role};
use benefits_core::stream::Version;
use thiserror::Error;

/// A business predicate that refused an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusinessRule {
    /// Approval needs a technical opinion for the current analysis cycle
    #[error("a technical opinion must be recorded before approval")]
    TechnicalOpinionRequired,

    /// Pending a request needs at least one pendency item
    #[error("at least one pendency item is required")]
    PendencyItemsRequired,

    /// The operation needs a non-blank justification or reason
    #[error("a justification is required")]
    JustificationRequired,

    /// Resubmission needs every pendency of the cycle resolved
    #[error("{count} pendencies are still open")]
    OpenPendencies {
        /// Pendencies still open in the current cycle
        count: usize,
    },

    /// A free-text field was blank
    #[error("{field} must not be empty")]
    EmptyNote {
        /// Which field was blank
        field: &'static str,
    },

    /// Released payments must carry a positive amount
    #[error("payment amount must be greater than zero")]
    PaymentAmountRequired,
}

/// Why the transition guard denied an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The operation is not available from the current status
    #[error("cannot {operation} a request in status {from}")]
    InvalidTransition {
        /// Current status
        from: RequestStatus,
        /// Operation attempted
        operation: &'static str,
    },

    /// None of the actor's roles may perform the operation
    #[error("{operation} requires one of {required:?}")]
    RoleNotPermitted {
        /// Operation attempted
        operation: &'static str,
        /// Roles that would have been accepted
        required: Vec<Role>,
    },

    /// A business rule refused the operation
    #[error("business rule violated: {0}")]
    BusinessRuleViolation(BusinessRule),
}

/// Errors returned by request operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Refused by the transition guard
    #[error(transparent)]
    Denied(#[from] Denial),

    /// Mandatory documents are not attached
    #[error("missing mandatory documents: {}", join(.0))]
    MissingDocuments(Vec<DocumentType>),

    /// Minor beneficiary without a valid first-degree legal representative
    #[error("invalid representative: {0}")]
    InvalidRepresentative(String),

    /// No workflow route is configured for the benefit type
    #[error("no workflow route configured for benefit type {0}")]
    ConfigurationMissing(BenefitType),

    /// The beneficiary has no payment channel on record
    #[error("beneficiary {0} has no payment channel on record")]
    PaymentInfoMissing(CitizenId),

    /// Someone else changed the request first; reload and retry
    #[error("request {request_id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        /// Request that was written
        request_id: RequestId,
        /// Version the caller supplied
        expected: Version,
        /// Version actually stored
        actual: Version,
    },

    /// No such request
    #[error("request {0} not found")]
    NotFound(RequestId),

    /// No such pendency on the request
    #[error("pendency {0} not found")]
    PendencyNotFound(PendencyId),

    /// The pendency was already resolved
    #[error("pendency {0} is already resolved")]
    PendencyAlreadyResolved(PendencyId),

    /// The commit could not be persisted
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RequestError {
    /// True for guard denials of the transition table or the role matrix.
    #[must_use]
    pub const fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::Denied(Denial::InvalidTransition { .. } | Denial::RoleNotPermitted { .. })
        )
    }

    /// True when the caller can act on the error (everything but storage faults).
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }

    /// Short, stable label used for metrics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Denied(Denial::InvalidTransition { .. }) => "invalid_transition",
            Self::Denied(Denial::RoleNotPermitted { .. }) => "role_not_permitted",
            Self::Denied(Denial::BusinessRuleViolation(_)) => "business_rule_violation",
            Self::MissingDocuments(_) => "missing_documents",
            Self::InvalidRepresentative(_) => "invalid_representative",
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::PaymentInfoMissing(_) => "payment_info_missing",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotFound(_) => "not_found",
            Self::PendencyNotFound(_) => "pendency_not_found",
            Self::PendencyAlreadyResolved(_) => "pendency_already_resolved",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<BusinessRule> for RequestError {
    fn from(rule: BusinessRule) -> Self {
        Self::Denied(Denial::BusinessRuleViolation(rule))
    }
}

fn join(documents: &[DocumentType]) -> String {
    documents
        .iter()
        .map(DocumentType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result alias for request operations.
pub type Result<T> = std::result::Result<T, RequestError>;
