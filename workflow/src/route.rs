//! Per-benefit-type workflow routes.
//!
//! A route is data: an ordered list of gates. At most one triage gate comes
//! first (a technician reviews the submitted request before analysis), then
//! one or more approval gates that must be passed in order. Requests copy
//! their route when they are created, so later configuration edits only
//! affect new requests.

use crate::types::{BenefitType, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Errors from route configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowConfigError {
    /// No route is configured for the benefit type
    #[error("no workflow route configured for benefit type {0}")]
    ConfigurationMissing(BenefitType),

    /// The route has no approval gate
    #[error("route for {0} has no approval gate")]
    NoApprovalGate(BenefitType),

    /// A gate accepts no role
    #[error("gate {gate} has no roles")]
    GateWithoutRoles {
        /// Gate name
        gate: String,
    },

    /// A triage gate appears after the first position
    #[error("triage gate {gate} must be the first gate")]
    MisplacedTriage {
        /// Gate name
        gate: String,
    },
}

/// What a gate does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    /// Review of an `Open` request before analysis
    Triage,
    /// Sign-off during analysis
    Approval,
}

/// One role/sector gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowGate {
    /// Sector or step name, e.g. `"social-assistance-board"`
    pub name: String,
    /// What the gate does
    pub kind: GateKind,
    /// Roles allowed to pass the gate
    pub roles: Vec<Role>,
}

impl WorkflowGate {
    /// A triage gate.
    #[must_use]
    pub fn triage(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            name: name.into(),
            kind: GateKind::Triage,
            roles: roles.into_iter().collect(),
        }
    }

    /// An approval gate.
    #[must_use]
    pub fn approval(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            name: name.into(),
            kind: GateKind::Approval,
            roles: roles.into_iter().collect(),
        }
    }
}

/// The ordered gate list of a benefit type, as pinned on a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRoute {
    /// Benefit type the route belongs to
    pub benefit_type: BenefitType,
    /// Configuration revision the route was copied from
    pub config_version: u32,
    /// Gates in order
    pub gates: Vec<WorkflowGate>,
    /// When the route was copied onto the request; `None` in configuration
    pub pinned_at: Option<DateTime<Utc>>,
}

impl WorkflowRoute {
    /// True if submitted requests stop at `Open` for triage.
    #[must_use]
    pub fn has_triage(&self) -> bool {
        self.gates.first().is_some_and(|gate| gate.kind == GateKind::Triage)
    }

    /// Approval gates in order.
    pub fn approval_gates(&self) -> impl Iterator<Item = &WorkflowGate> {
        self.gates.iter().filter(|gate| gate.kind == GateKind::Approval)
    }

    /// Approval gate at `index`, if any.
    #[must_use]
    pub fn approval_gate(&self, index: usize) -> Option<&WorkflowGate> {
        self.approval_gates().nth(index)
    }

    /// Number of approval gates.
    #[must_use]
    pub fn approval_gate_count(&self) -> usize {
        self.approval_gates().count()
    }

    /// A copy stamped with the pin time.
    #[must_use]
    pub fn pinned(&self, at: DateTime<Utc>) -> Self {
        Self {
            pinned_at: Some(at),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), WorkflowConfigError> {
        if self.approval_gate_count() == 0 {
            return Err(WorkflowConfigError::NoApprovalGate(self.benefit_type.clone()));
        }
        for (index, gate) in self.gates.iter().enumerate() {
            if gate.roles.is_empty() {
                return Err(WorkflowConfigError::GateWithoutRoles {
                    gate: gate.name.clone(),
                });
            }
            if gate.kind == GateKind::Triage && index > 0 {
                return Err(WorkflowConfigError::MisplacedTriage {
                    gate: gate.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Resolves the current route of a benefit type.
///
/// Treated as a fast, local lookup.
pub trait WorkflowConfigResolver: Send + Sync {
    /// Current route for `benefit_type`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowConfigError::ConfigurationMissing`] if none is configured.
    fn resolve(&self, benefit_type: &BenefitType) -> Result<WorkflowRoute, WorkflowConfigError>;
}

/// Route table kept in memory and editable at runtime.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowConfig {
    routes: RwLock<HashMap<BenefitType, WorkflowRoute>>,
}

impl InMemoryWorkflowConfig {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the gates of `benefit_type`, bumping its revision.
    ///
    /// Returns the new revision number.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowConfigError`] if the gate list is malformed; the
    /// previous route stays in place.
    pub fn configure(
        &self,
        benefit_type: BenefitType,
        gates: Vec<WorkflowGate>,
    ) -> Result<u32, WorkflowConfigError> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let config_version = routes
            .get(&benefit_type)
            .map_or(1, |route| route.config_version + 1);

        let route = WorkflowRoute {
            benefit_type: benefit_type.clone(),
            config_version,
            gates,
            pinned_at: None,
        };
        route.validate()?;

        tracing::info!(
            benefit_type = %benefit_type,
            config_version,
            gates = route.gates.len(),
            "Workflow route configured"
        );
        routes.insert(benefit_type, route);
        Ok(config_version)
    }

    /// Builder-style [`configure`](Self::configure).
    ///
    /// # Errors
    ///
    /// Same as [`configure`](Self::configure).
    pub fn with_route(
        self,
        benefit_type: impl Into<BenefitType>,
        gates: Vec<WorkflowGate>,
    ) -> Result<Self, WorkflowConfigError> {
        self.configure(benefit_type.into(), gates)?;
        Ok(self)
    }
}

impl WorkflowConfigResolver for InMemoryWorkflowConfig {
    fn resolve(&self, benefit_type: &BenefitType) -> Result<WorkflowRoute, WorkflowConfigError> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(benefit_type)
            .cloned()
            .ok_or_else(|| WorkflowConfigError::ConfigurationMissing(benefit_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)] // Test code

    use super::*;

    fn gates() -> Vec<WorkflowGate> {
        vec![
            WorkflowGate::triage("reception", [Role::UnitTechnician]),
            WorkflowGate::approval("technical", [Role::TechnicalReviewer]),
            WorkflowGate::approval("board", [Role::Manager]),
        ]
    }

    #[test]
    fn resolve_returns_configured_route() {
        let config = InMemoryWorkflowConfig::new()
            .with_route("birth_allowance", gates())
            .unwrap();

        let route = config.resolve(&BenefitType::new("birth_allowance")).unwrap();
        assert!(route.has_triage());
        assert_eq!(route.approval_gate_count(), 2);
        assert_eq!(route.approval_gate(1).unwrap().name, "board");
        assert_eq!(route.config_version, 1);
    }

    #[test]
    fn unknown_benefit_type_is_configuration_missing() {
        let config = InMemoryWorkflowConfig::new();
        let error = config.resolve(&BenefitType::new("funeral_aid")).unwrap_err();
        assert_eq!(
            error,
            WorkflowConfigError::ConfigurationMissing(BenefitType::new("funeral_aid"))
        );
    }

    #[test]
    fn reconfiguring_bumps_revision() {
        let config = InMemoryWorkflowConfig::new();
        let benefit = BenefitType::new("birth_allowance");
        assert_eq!(config.configure(benefit.clone(), gates()).unwrap(), 1);
        assert_eq!(config.configure(benefit.clone(), gates()).unwrap(), 2);
        assert_eq!(config.resolve(&benefit).unwrap().config_version, 2);
    }

    #[test]
    fn malformed_routes_are_rejected() {
        let config = InMemoryWorkflowConfig::new();
        let benefit = BenefitType::new("x");

        let no_approval = vec![WorkflowGate::triage("reception", [Role::UnitTechnician])];
        assert!(matches!(
            config.configure(benefit.clone(), no_approval),
            Err(WorkflowConfigError::NoApprovalGate(_))
        ));

        let late_triage = vec![
            WorkflowGate::approval("technical", [Role::TechnicalReviewer]),
            WorkflowGate::triage("reception", [Role::UnitTechnician]),
        ];
        assert!(matches!(
            config.configure(benefit.clone(), late_triage),
            Err(WorkflowConfigError::MisplacedTriage { .. })
        ));

        let empty_roles = vec![WorkflowGate::approval("technical", Vec::<Role>::new())];
        assert!(matches!(
            config.configure(benefit.clone(), empty_roles),
            Err(WorkflowConfigError::GateWithoutRoles { .. })
        ));

        assert!(config.resolve(&benefit).is_err());
    }

    #[test]
    fn pinned_copy_keeps_gates_and_stamps_time() {
        let route = WorkflowRoute {
            benefit_type: BenefitType::new("x"),
            config_version: 3,
            gates: gates(),
            pinned_at: None,
        };
        let at = Utc::now();
        let pinned = route.pinned(at);
        assert_eq!(pinned.pinned_at, Some(at));
        assert_eq!(pinned.gates, route.gates);
    }
}
