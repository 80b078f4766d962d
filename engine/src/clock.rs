//! Ordering and time sources.
//!
//! [`Timeserial`] is the server-assigned total order used for conflict
//! resolution. [`LocalClock`] generates provisional identifiers for locally
//! originated messages before the server has assigned them a serial.
//! [`SimpleClock`] supplies wall-clock time for tombstone aging.

use crate::{MessageId, SiteCode, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A server-assigned serial attached to every applied operation.
///
/// Ordering is lexicographic on the serial string. Server serials embed the
/// originating site, so two distinct operations never share a serial and an
/// equal serial always denotes the same operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeserial(String);

impl Timeserial {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    /// Parse an optional wire serial. Empty strings are treated as absent.
    pub fn from_wire(serial: Option<&str>) -> Option<Self> {
        match serial {
            Some(s) if !s.is_empty() => Some(Self(s.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timeserial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates provisional message identifiers for local operations.
///
/// The identifier travels in the outbound message `id` field and comes back
/// unchanged on the server echo, which is how optimistic state is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalClock {
    /// Identifier of this client
    pub site: SiteCode,
    /// Monotonically increasing counter
    pub counter: u64,
}

impl LocalClock {
    /// Create a new clock for a client, starting at counter 0.
    pub fn new(site: impl Into<SiteCode>) -> Self {
        Self {
            site: site.into(),
            counter: 0,
        }
    }

    /// Increment the clock and return the next message id.
    pub fn tick(&mut self) -> MessageId {
        self.counter += 1;
        format!("{}:{}", self.site, self.counter)
    }
}

/// A source of the current time in milliseconds since the Unix epoch.
pub trait SimpleClock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl SimpleClock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeserial_orders_lexicographically() {
        let a = Timeserial::new("01726585978590-001@siteA:001");
        let b = Timeserial::new("01726585978590-002@siteA:000");
        let c = Timeserial::new("01726585978591-000@siteB:000");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn empty_wire_serial_is_absent() {
        assert_eq!(Timeserial::from_wire(None), None);
        assert_eq!(Timeserial::from_wire(Some("")), None);
        assert_eq!(
            Timeserial::from_wire(Some("05")),
            Some(Timeserial::new("05"))
        );
    }

    #[test]
    fn tick_produces_unique_message_ids() {
        let mut clock = LocalClock::new("client-1");
        assert_eq!(clock.tick(), "client-1:1");
        assert_eq!(clock.tick(), "client-1:2");
        assert_eq!(clock.counter, 2);
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now(), 1_500);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn local_clock_serialization_format() {
        let clock = LocalClock {
            site: "client-1".into(),
            counter: 10,
        };
        let json = serde_json::to_string(&clock).unwrap();
        assert_eq!(json, r#"{"site":"client-1","counter":10}"#);
    }
}
