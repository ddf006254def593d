//! Transition guard.
//!
//! [`decide`] is a pure function of the current status, the requested
//! operation, the actor and a read-only view of the request. Checks run in a
//! fixed order: the status table first, then the role table, then the
//! business predicates, so the first failing layer names the denial.

use crate::aggregate::BenefitRequest;
use crate::error::{BusinessRule, Denial};
use crate::types::{Actor, RequestStatus, Role};

/// An operation as seen by the guard, with the inputs its predicates need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation<'a> {
    /// `Draft -> Open` (and on to `InAnalysis` without triage)
    Submit,
    /// `Open -> InAnalysis`
    SendToAnalysis,
    /// Record document metadata
    AttachDocument,
    /// Record the technical opinion of the current cycle
    RecordOpinion {
        /// Opinion text
        text: &'a str,
    },
    /// Pass the current approval gate
    Approve,
    /// `InAnalysis -> Pending`
    Pend {
        /// Why the request is pended
        justification: &'a str,
        /// One description per pendency
        items: &'a [String],
    },
    /// `InAnalysis -> Cancelled`
    Reject {
        /// Why the request is rejected
        justification: &'a str,
    },
    /// Close one pendency
    ResolvePendency {
        /// What was done
        note: &'a str,
    },
    /// `Pending -> InAnalysis`
    Resubmit,
    /// `Approved -> Released`
    Release {
        /// Amount paid out
        amount_cents: u64,
    },
    /// `Released -> Completed`
    Complete {
        /// Delivery confirmation
        delivery_note: &'a str,
    },
    /// Any non-terminal status `-> Cancelled`
    Cancel {
        /// Why the request is cancelled
        reason: &'a str,
    },
}

impl Operation<'_> {
    /// Stable operation name used in denials, history and audit.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::SendToAnalysis => "send_to_analysis",
            Self::AttachDocument => "attach_document",
            Self::RecordOpinion { .. } => "record_technical_opinion",
            Self::Approve => "approve",
            Self::Pend { .. } => "pend",
            Self::Reject { .. } => "reject",
            Self::ResolvePendency { .. } => "resolve_pendency",
            Self::Resubmit => "resubmit",
            Self::Release { .. } => "release",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
        }
    }

    /// Statuses the operation may start from.
    #[must_use]
    pub const fn allowed_from(&self) -> &'static [RequestStatus] {
        use RequestStatus::{Approved, Draft, InAnalysis, Open, Pending, Released};
        match self {
            Self::Submit => &[Draft],
            Self::SendToAnalysis => &[Open],
            Self::AttachDocument => &[Draft, Open, InAnalysis, Pending],
            Self::RecordOpinion { .. } | Self::Approve | Self::Pend { .. } | Self::Reject { .. } => {
                &[InAnalysis]
            },
            Self::ResolvePendency { .. } | Self::Resubmit => &[Pending],
            Self::Release { .. } => &[Approved],
            Self::Complete { .. } => &[Released],
            Self::Cancel { .. } => &[Draft, Open, InAnalysis, Pending, Approved],
        }
    }

    /// Roles the role table permits for the operation.
    ///
    /// `Approve` is further narrowed to the current gate and `Cancel` is also
    /// open to the request owner; see [`decide`].
    #[must_use]
    pub const fn permitted_roles(&self) -> &'static [Role] {
        use Role::{Admin, Manager, TechnicalReviewer, UnitTechnician};
        match self {
            Self::Submit => &[UnitTechnician, Admin],
            Self::SendToAnalysis
            | Self::AttachDocument
            | Self::ResolvePendency { .. }
            | Self::Resubmit
            | Self::Release { .. }
            | Self::Complete { .. } => &[UnitTechnician, Manager, Admin],
            Self::RecordOpinion { .. } => &[TechnicalReviewer, Admin],
            Self::Approve | Self::Pend { .. } | Self::Reject { .. } => {
                &[Manager, TechnicalReviewer, Admin]
            },
            Self::Cancel { .. } => &[Admin, Manager],
        }
    }
}

/// Outcome of [`decide`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The operation may proceed
    Allow,
    /// The operation is refused
    Deny(Denial),
}

impl Decision {
    /// Convert into a `Result` for `?` propagation.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] when the decision is [`Decision::Deny`].
    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(denial) => Err(denial),
        }
    }

    /// True for [`Decision::Allow`].
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decide whether `actor` may perform `operation` on `request` in `current`.
#[must_use]
pub fn decide(
    current: RequestStatus,
    operation: &Operation<'_>,
    actor: &Actor,
    request: &BenefitRequest,
) -> Decision {
    match check(current, operation, actor, request) {
        Ok(()) => Decision::Allow,
        Err(denial) => Decision::Deny(denial),
    }
}

/// Creation is open to any program role.
///
/// # Errors
///
/// [`Denial::RoleNotPermitted`] when the actor holds no role.
pub fn authorize_create(actor: &Actor) -> Result<(), Denial> {
    if actor.has_any_role(&Role::ALL) {
        Ok(())
    } else {
        Err(Denial::RoleNotPermitted {
            operation: "create",
            required: Role::ALL.to_vec(),
        })
    }
}

fn check(
    current: RequestStatus,
    operation: &Operation<'_>,
    actor: &Actor,
    request: &BenefitRequest,
) -> Result<(), Denial> {
    if !operation.allowed_from().contains(&current) {
        return Err(Denial::InvalidTransition {
            from: current,
            operation: operation.name(),
        });
    }
    check_role(operation, actor, request)?;
    check_rules(operation, request).map_err(Denial::BusinessRuleViolation)
}

fn check_role(operation: &Operation<'_>, actor: &Actor, request: &BenefitRequest) -> Result<(), Denial> {
    let denied = |required: Vec<Role>| Denial::RoleNotPermitted {
        operation: operation.name(),
        required,
    };

    let table = operation.permitted_roles();
    match operation {
        Operation::Cancel { .. } => {
            if actor.user_id == request.created_by || actor.has_any_role(table) {
                Ok(())
            } else {
                Err(denied(table.to_vec()))
            }
        },
        Operation::Approve => {
            if !actor.has_any_role(table) {
                return Err(denied(table.to_vec()));
            }
            if actor.has_role(Role::Admin) {
                return Ok(());
            }
            // Non-admin approvals must match the gate the request is waiting on.
            match request.current_approval_gate() {
                Some(gate) if actor.has_any_role(&gate.roles) => Ok(()),
                Some(gate) => {
                    let mut required = gate.roles.clone();
                    required.push(Role::Admin);
                    Err(denied(required))
                },
                None => Ok(()),
            }
        },
        _ => {
            if actor.has_any_role(table) {
                Ok(())
            } else {
                Err(denied(table.to_vec()))
            }
        },
    }
}

fn check_rules(operation: &Operation<'_>, request: &BenefitRequest) -> Result<(), BusinessRule> {
    match operation {
        Operation::RecordOpinion { text } => non_blank(text, "technical_opinion"),
        Operation::Approve => {
            if request.technical_opinion.is_none() {
                return Err(BusinessRule::TechnicalOpinionRequired);
            }
            Ok(())
        },
        Operation::Pend {
            justification,
            items,
        } => {
            if items.is_empty() {
                return Err(BusinessRule::PendencyItemsRequired);
            }
            if items.iter().any(|item| is_blank(item)) {
                return Err(BusinessRule::EmptyNote {
                    field: "pendency_description",
                });
            }
            if is_blank(justification) {
                return Err(BusinessRule::JustificationRequired);
            }
            Ok(())
        },
        Operation::Reject { justification } => {
            if is_blank(justification) {
                return Err(BusinessRule::JustificationRequired);
            }
            Ok(())
        },
        Operation::Cancel { reason } => {
            if is_blank(reason) {
                return Err(BusinessRule::JustificationRequired);
            }
            Ok(())
        },
        Operation::ResolvePendency { note } => non_blank(note, "resolution_note"),
        Operation::Resubmit => {
            let count = request.pendencies.open_in_current_cycle().count();
            if count > 0 {
                return Err(BusinessRule::OpenPendencies { count });
            }
            Ok(())
        },
        Operation::Release { amount_cents } => {
            if *amount_cents == 0 {
                return Err(BusinessRule::PaymentAmountRequired);
            }
            Ok(())
        },
        Operation::Complete { delivery_note } => non_blank(delivery_note, "delivery_note"),
        Operation::Submit | Operation::SendToAnalysis | Operation::AttachDocument => Ok(()),
    }
}

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn non_blank(text: &str, field: &'static str) -> Result<(), BusinessRule> {
    if is_blank(text) {
        Err(BusinessRule::EmptyNote { field })
    } else {
        Ok(())
    }
}
