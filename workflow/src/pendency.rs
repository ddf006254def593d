//! Pendency items raised during analysis.
//!
//! A `pend` decision opens a new analysis cycle and raises one item per
//! description. Items are resolved one at a time (`Open -> Resolved`, terminal)
//! and the request may only be resubmitted once every item of the current
//! cycle is resolved. Items from earlier cycles stay on the request as history.

use crate::types::{PendencyId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from pendency bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PendencyError {
    /// No pendency with that id on the request
    #[error("pendency {0} not found")]
    NotFound(PendencyId),

    /// The pendency was already resolved
    #[error("pendency {0} is already resolved")]
    AlreadyResolved(PendencyId),
}

/// How and by whom a pendency was resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendencyResolution {
    /// Resolving user
    pub resolved_by: UserId,
    /// Resolution time
    pub resolved_at: DateTime<Utc>,
    /// What was done
    pub note: String,
}

/// One outstanding issue raised by a reviewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pendency {
    /// Identity
    pub id: PendencyId,
    /// Analysis cycle the item was raised in
    pub cycle: u32,
    /// What must be fixed
    pub description: String,
    /// Reviewer that raised it
    pub raised_by: UserId,
    /// When it was raised
    pub raised_at: DateTime<Utc>,
    /// Set once resolved
    pub resolution: Option<PendencyResolution>,
}

impl Pendency {
    /// True while unresolved.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

/// All pendencies of a request plus the current cycle counter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pendencies {
    items: Vec<Pendency>,
    cycle: u32,
}

impl Pendencies {
    /// Current analysis cycle; `0` until the first `pend`.
    #[must_use]
    pub const fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Every item ever raised, in order.
    #[must_use]
    pub fn items(&self) -> &[Pendency] {
        &self.items
    }

    /// Look up an item.
    #[must_use]
    pub fn get(&self, id: PendencyId) -> Option<&Pendency> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Start a new cycle and raise one item per description.
    ///
    /// Returns the raised items.
    pub fn raise_cycle<I, S>(&mut self, descriptions: I, raised_by: UserId, raised_at: DateTime<Utc>) -> &[Pendency]
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cycle += 1;
        let first = self.items.len();
        let cycle = self.cycle;
        self.items.extend(descriptions.into_iter().map(|description| Pendency {
            id: PendencyId::new(),
            cycle,
            description: description.into(),
            raised_by,
            raised_at,
            resolution: None,
        }));
        &self.items[first..]
    }

    /// Mark an item resolved.
    ///
    /// # Errors
    ///
    /// [`PendencyError::NotFound`] for unknown ids and
    /// [`PendencyError::AlreadyResolved`] for items already closed.
    pub fn resolve(
        &mut self,
        id: PendencyId,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Result<&Pendency, PendencyError> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(PendencyError::NotFound(id))?;
        if !item.is_open() {
            return Err(PendencyError::AlreadyResolved(id));
        }
        item.resolution = Some(PendencyResolution {
            resolved_by,
            resolved_at,
            note: note.into(),
        });
        Ok(item)
    }

    /// Unresolved items of the current cycle.
    pub fn open_in_current_cycle(&self) -> impl Iterator<Item = &Pendency> {
        let cycle = self.cycle;
        self.items
            .iter()
            .filter(move |item| item.cycle == cycle && item.is_open())
    }

    /// True when nothing of the current cycle is left open.
    #[must_use]
    pub fn all_resolved_for_current_cycle(&self) -> bool {
        self.open_in_current_cycle().next().is_none()
    }
}
