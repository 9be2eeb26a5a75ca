//! Core identifiers, timestamps and the session record

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// String Identifiers
// ----------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: Into<String>>(value: S) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable end-user identity
    Uid
);
string_id!(
    /// Logical client category (mobile, desktop, ...)
    Platform
);
string_id!(
    /// Identity of the gateway process hosting a session
    GatewayId
);
string_id!(
    /// Per-connection session identifier
    ///
    /// Generated ids are UUID v7 strings, so lexicographic order is creation
    /// order. Directory lookups rely on this for "most recent session first".
    Sid
);

impl Sid {
    /// Generate a fresh, time-ordered session id
    pub fn generate() -> Self {
        Self(new_seq())
    }
}

/// Generate a fresh, time-ordered sequence id for envelopes and frames
pub fn new_seq() -> String {
    uuid::Uuid::now_v7().to_string()
}

// ----------------------------------------------------------------------------
// Session Record
// ----------------------------------------------------------------------------

/// Authenticated identity of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: Uid,
    pub platform: Platform,
}

impl Identity {
    pub fn new<U: Into<Uid>, P: Into<Platform>>(uid: U, platform: P) -> Self {
        Self {
            uid: uid.into(),
            platform: platform.into(),
        }
    }
}

/// A live session as recorded in the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub sid: Sid,
    pub uid: Uid,
    pub platform: Platform,
    pub gateway_id: GatewayId,
}

impl Session {
    pub fn new(sid: Sid, uid: Uid, platform: Platform, gateway_id: GatewayId) -> Self {
        Self {
            sid,
            uid,
            platform,
            gateway_id,
        }
    }

    /// A session is only usable when every field is populated
    pub fn is_valid(&self) -> bool {
        !self.sid.is_empty()
            && !self.uid.is_empty()
            && !self.platform.is_empty()
            && !self.gateway_id.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Unix timestamp in milliseconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    /// Saturating difference; an earlier `self` yields zero
    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds, the granularity offline expiry works in
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Clock abstraction used by every time-dependent decision
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for deterministic tests and simulations
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    current: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.current
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.current.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_validity_requires_all_fields() {
        let session = Session::new("s1".into(), "u1".into(), "ios".into(), "gw-1".into());
        assert!(session.is_valid());

        let mut missing_gateway = session.clone();
        missing_gateway.gateway_id = GatewayId::default();
        assert!(!missing_gateway.is_valid());

        let mut missing_platform = session;
        missing_platform.platform = Platform::new("");
        assert!(!missing_platform.is_valid());
    }

    #[test]
    fn test_generated_sids_are_ordered() {
        let sids: Vec<Sid> = (0..64).map(|_| Sid::generate()).collect();
        let mut sorted = sids.clone();
        sorted.sort();
        assert_eq!(sids, sorted);
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(Timestamp::from_secs(100));
        assert_eq!(clock.now().as_secs(), 100);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now().as_millis(), 101_500);
        assert_eq!(clock.now() - Timestamp::from_secs(100), Duration::from_millis(1500));
        assert_eq!(Timestamp::from_secs(1) - clock.now(), Duration::ZERO);
    }
}
