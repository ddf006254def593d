//! Beneficiary payment channel lookup.

use crate::types::{CitizenId, PaymentChannel};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Answers whether a beneficiary has payment channel data on record.
pub trait PaymentChannelProvider: Send + Sync {
    /// The channel on record for `citizen`, if any.
    fn payment_channel(&self, citizen: &CitizenId) -> Option<PaymentChannel>;
}

/// Payment channels kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPaymentChannels {
    channels: RwLock<HashMap<CitizenId, PaymentChannel>>,
}

impl InMemoryPaymentChannels {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace the channel of `citizen`.
    pub fn register(&self, citizen: CitizenId, channel: PaymentChannel) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(citizen, channel);
    }

    /// Forget the channel of `citizen`.
    pub fn remove(&self, citizen: &CitizenId) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(citizen);
    }
}

impl PaymentChannelProvider for InMemoryPaymentChannels {
    fn payment_channel(&self, citizen: &CitizenId) -> Option<PaymentChannel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(citizen)
            .cloned()
    }
}
