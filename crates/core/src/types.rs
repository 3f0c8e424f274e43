//! Identifier and timestamp types
//!
//! Session ids, event ids and object ids are client-supplied opaque strings
//! and stay `String` throughout. Batch ids are generated by the store and
//! get a dedicated newtype.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session batch
///
/// Generated by the clickstream store when a new collecting batch is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Generate a fresh batch id
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse from the canonical string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(BatchId)
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp
///
/// Represents a point in time as milliseconds since Unix epoch. This is the
/// canonical time representation of the clickstream data model: session and
/// event creation times arrive from clients in epoch milliseconds.
///
/// ## Invariants
///
/// - Timestamps are always non-negative (u64)
/// - Timestamps are always in milliseconds
/// - Timestamps are comparable and orderable
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp for the current moment
    ///
    /// Returns epoch (0) if the system clock is before Unix epoch.
    pub fn now() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        Timestamp(millis)
    }

    /// Create a timestamp from milliseconds since epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Create a timestamp from seconds since epoch
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000))
    }

    /// Milliseconds since epoch
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_unique() {
        let a = BatchId::new();
        let b = BatchId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_batch_id_parse_roundtrip() {
        let id = BatchId::new();
        let parsed = BatchId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(BatchId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_batch_id_serde_roundtrip() {
        let id = BatchId::new();
        let json = serde_json::to_string(&id).unwrap();
        let restored: BatchId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_timestamp_constructors() {
        assert_eq!(Timestamp::from_secs(1).as_millis(), 1_000);
        assert_eq!(Timestamp::from_millis(1_234).as_millis(), 1_234);
        assert_eq!(Timestamp::EPOCH.as_millis(), 0);
    }

    #[test]
    fn test_timestamp_now_not_epoch() {
        assert!(Timestamp::now() > Timestamp::EPOCH);
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::from_millis(1) < Timestamp::from_millis(2));
    }

    #[test]
    fn test_timestamp_from_secs_saturates() {
        let t = Timestamp::from_secs(u64::MAX);
        assert_eq!(t.as_millis(), u64::MAX);
    }
}
