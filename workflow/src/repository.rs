//! In-memory request storage with one write slot per request.
//!
//! Each request lives behind its own async mutex, so writers to different
//! requests never wait on each other. The table lock is only held to look a
//! slot up or insert a new one.

use crate::aggregate::BenefitRequest;
use crate::error::{RequestError, Result};
use crate::types::RequestId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Shared handle to one request's write slot.
pub type RequestSlot = Arc<Mutex<BenefitRequest>>;

/// Request table.
#[derive(Debug, Default)]
pub struct RequestRepository {
    slots: RwLock<HashMap<RequestId, RequestSlot>>,
}

impl RequestRepository {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a newly created request.
    ///
    /// # Errors
    ///
    /// [`RequestError::Storage`] if the id is already taken.
    pub fn insert(&self, request: BenefitRequest) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let id = request.id();
        if slots.contains_key(&id) {
            return Err(RequestError::Storage(format!("request {id} already exists")));
        }
        slots.insert(id, Arc::new(Mutex::new(request)));
        Ok(())
    }

    /// Write slot of a request.
    #[must_use]
    pub fn slot(&self, id: RequestId) -> Option<RequestSlot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of a request.
    pub async fn get(&self, id: RequestId) -> Option<BenefitRequest> {
        let slot = self.slot(id)?;
        let request = slot.lock().await;
        Some(request.clone())
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
