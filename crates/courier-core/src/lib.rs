//! Courier Core
//!
//! Foundational types shared by every Courier process: the error taxonomy,
//! identifiers and the session record, application messages, queue envelopes,
//! client/gateway frames and configuration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod message;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    CourierConfig, DeliveryConfig, DirectoryConfig, GatewayConfig, OfflineConfig,
    PlatformConfig, MIN_ACK_WAIT,
};
pub use envelope::{
    Envelope, EnvelopeBody, KickoutSession, PlatformFilter, SendOfflineToSession, ToUid,
};
pub use errors::{CourierError, CourierResult, Result};
pub use frame::{ClientFrame, ServerFrame};
pub use message::{KickoutReason, Message, MessageOptions};
pub use types::{
    new_seq, GatewayId, Identity, ManualTimeSource, Platform, Session, Sid, SystemTimeSource,
    TimeSource, Timestamp, Uid,
};
