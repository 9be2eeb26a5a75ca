//! Error types for the Courier delivery platform
//!
//! A single [`CourierError`] carries the whole taxonomy so that every layer
//! (session actor, directory, offline store, delivery workers) can classify a
//! failure the same way: terminal and cleanup-worthy (`NotFound`), fail-fast
//! (`Backpressure`, `Invalid`) or retryable (`Unavailable`, `AckTimeout`, ...).

use crate::message::KickoutReason;

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for Courier
///
/// `Clone` so that a session's terminal error can be observed by every path
/// that is waiting on the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CourierError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Outbound buffer full (capacity: {capacity})")]
    Backpressure { capacity: usize },

    #[error("No ack for {seq} within {wait_ms}ms")]
    AckTimeout { seq: String, wait_ms: u64 },

    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Unimplemented: {what}")]
    Unimplemented { what: String },

    #[error("Invalid input: {reason}")]
    Invalid { reason: String },

    #[error("Authentication failed: {reason}")]
    Unauthenticated { reason: String },

    /// Terminal error recorded on a session that was kicked out
    #[error("Kicked out: {reason}")]
    Kickout { reason: KickoutReason },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// Backing store (directory or offline) failure
    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl From<bincode::Error> for CourierError {
    fn from(err: bincode::Error) -> Self {
        CourierError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for CourierError {
    fn from(err: toml::de::Error) -> Self {
        CourierError::Configuration {
            reason: err.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CourierError {
    /// Create a not-found error for the given entity
    pub fn not_found<T: Into<String>>(what: T) -> Self {
        CourierError::NotFound { what: what.into() }
    }

    /// Create a session not found error
    pub fn session_not_found<S: core::fmt::Display>(sid: S) -> Self {
        CourierError::NotFound {
            what: format!("session {}", sid),
        }
    }

    /// Create a backpressure error for a full buffer
    pub fn backpressure(capacity: usize) -> Self {
        CourierError::Backpressure { capacity }
    }

    /// Create an ack timeout error
    pub fn ack_timeout<S: Into<String>>(seq: S, wait: core::time::Duration) -> Self {
        CourierError::AckTimeout {
            seq: seq.into(),
            wait_ms: wait.as_millis() as u64,
        }
    }

    /// Create an unavailable error with a reason
    pub fn unavailable<T: Into<String>>(reason: T) -> Self {
        CourierError::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create an internal error with a reason
    pub fn internal<T: Into<String>>(reason: T) -> Self {
        CourierError::Internal {
            reason: reason.into(),
        }
    }

    pub fn unimplemented<T: Into<String>>(what: T) -> Self {
        CourierError::Unimplemented { what: what.into() }
    }

    /// Create an invalid input error with a reason
    pub fn invalid<T: Into<String>>(reason: T) -> Self {
        CourierError::Invalid {
            reason: reason.into(),
        }
    }

    pub fn unauthenticated<T: Into<String>>(reason: T) -> Self {
        CourierError::Unauthenticated {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CourierError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a storage error with a reason
    pub fn storage<T: Into<String>>(reason: T) -> Self {
        CourierError::Storage {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

impl CourierError {
    /// The target session or user is gone; callers clean up instead of retrying.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CourierError::NotFound { .. })
    }

    /// Whether redelivering the same work later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Backpressure { .. }
                | CourierError::AckTimeout { .. }
                | CourierError::Unavailable { .. }
                | CourierError::Internal { .. }
                | CourierError::Storage { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CourierError>;
pub type CourierResult<T> = Result<T>;
