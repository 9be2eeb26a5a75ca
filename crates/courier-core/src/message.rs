//! Application messages and their delivery options

use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Message Options
// ----------------------------------------------------------------------------

/// Bitmask of per-message delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageOptions(u32);

impl MessageOptions {
    pub const NONE: Self = Self(0);
    /// The client must confirm the push before it counts as delivered
    pub const NEED_ACK: Self = Self(1);
    /// Store the message when no session of a platform is reachable
    pub const NEED_OFFLINE: Self = Self(1 << 1);
    /// Request an out-of-band notification
    pub const NEED_NOTIFICATION: Self = Self(1 << 2);

    const ALL: u32 = 0b111;

    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MessageOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A single application message with an opaque body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub seq: String,
    pub options: MessageOptions,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new<S: Into<String>>(seq: S, options: MessageOptions, body: Vec<u8>) -> Self {
        Self {
            seq: seq.into(),
            options,
            body,
        }
    }

    pub fn needs_ack(&self) -> bool {
        self.options.contains(MessageOptions::NEED_ACK)
    }

    pub fn needs_offline(&self) -> bool {
        self.options.contains(MessageOptions::NEED_OFFLINE)
    }

    /// Blob form used by the offline store
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ----------------------------------------------------------------------------
// Kickout Reasons
// ----------------------------------------------------------------------------

/// Reason code sent along with a kickout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KickoutReason {
    /// A newer session for the same uid and platform connected
    DuplicatePlatformLogin,
    /// The gateway is shutting down
    ServerShutdown,
    /// An operator or upstream service asked for the disconnect
    Requested,
}

impl fmt::Display for KickoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KickoutReason::DuplicatePlatformLogin => write!(f, "duplicate platform login"),
            KickoutReason::ServerShutdown => write!(f, "server shutdown"),
            KickoutReason::Requested => write!(f, "requested"),
        }
    }
}
