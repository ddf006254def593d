//! Aggregate identity and optimistic-concurrency versions.
//!
//! `StreamId` names one aggregate instance (`"request-<uuid>"`) and doubles as
//! the event partition key. `Version` is the counter a caller echoes back on
//! every mutating call; a mismatch means someone else wrote first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one aggregate instance.
///
/// ```
/// use benefits_core::stream::StreamId;
///
/// let id = StreamId::new("request-42");
/// assert_eq!(id.as_str(), "request-42");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a `StreamId` from application-controlled data.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optimistic-concurrency version of an aggregate.
///
/// A freshly created aggregate is at [`Version::INITIAL`]; each accepted
/// mutation moves it forward by one.
///
/// ```
/// use benefits_core::stream::Version;
///
/// let v = Version::INITIAL.next().next();
/// assert_eq!(v.value(), 2);
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version of a freshly created aggregate.
    pub const INITIAL: Self = Self(0);

    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version after one more mutation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_displays_raw_value() {
        assert_eq!(StreamId::new("request-7").to_string(), "request-7");
    }

    #[test]
    fn version_orders_and_advances() {
        let v0 = Version::INITIAL;
        let v1 = v0.next();
        assert!(v1 > v0);
        assert_eq!(v1, Version::new(1));
        assert_eq!(Version::from(9).to_string(), "9");
        assert_eq!(Version::default(), Version::INITIAL);
    }

    #[test]
    fn version_next_saturates() {
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
    }
}
