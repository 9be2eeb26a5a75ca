//! Queue payloads
//!
//! Every record on the primary, retry and dead-letter topics is an
//! [`Envelope`] encoded with bincode. The body is a closed sum type; a payload
//! whose variant tag is not one of the known bodies fails to decode with
//! [`CourierError::Invalid`] and is never silently skipped.

use crate::errors::{CourierError, Result};
use crate::message::{KickoutReason, Message};
use crate::types::{new_seq, Platform, Sid, Timestamp, Uid};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Platform Filter
// ----------------------------------------------------------------------------

/// Which platforms of a user a fan-out targets
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlatformFilter {
    #[default]
    All,
    /// Allow-list; names outside the configured platforms are ignored
    Only(Vec<Platform>),
    /// Deny-list
    Except(Vec<Platform>),
}

impl PlatformFilter {
    /// Resolve against the configured platforms, preserving configured order
    pub fn resolve(&self, configured: &[Platform]) -> Vec<Platform> {
        match self {
            PlatformFilter::All => configured.to_vec(),
            PlatformFilter::Only(allowed) => configured
                .iter()
                .filter(|platform| allowed.contains(platform))
                .cloned()
                .collect(),
            PlatformFilter::Except(denied) => configured
                .iter()
                .filter(|platform| !denied.contains(platform))
                .cloned()
                .collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope Bodies
// ----------------------------------------------------------------------------

/// Fan-out of messages to every selected platform of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToUid {
    pub uid: Uid,
    pub messages: Vec<Message>,
    pub platforms: PlatformFilter,
    /// Opaque field carried through for the producer's own bookkeeping
    pub passthrough: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickoutSession {
    pub uid: Uid,
    pub sid: Sid,
    pub reason: KickoutReason,
}

/// Trigger delivery of the offline backlog to a freshly connected session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOfflineToSession {
    pub uid: Uid,
    pub sid: Sid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeBody {
    ToUid(ToUid),
    KickoutSession(KickoutSession),
    SendOfflineToSession(SendOfflineToSession),
}

impl EnvelopeBody {
    /// Short variant name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::ToUid(_) => "to_uid",
            EnvelopeBody::KickoutSession(_) => "kickout_session",
            EnvelopeBody::SendOfflineToSession(_) => "send_offline_to_session",
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: String,
    pub timestamp: Timestamp,
    /// Never decreases across republishes
    pub retry_count: u32,
    pub last_attempt_at: Option<Timestamp>,
    pub body: EnvelopeBody,
}

impl Envelope {
    /// Create a first-attempt envelope with a fresh seq
    pub fn new(body: EnvelopeBody, timestamp: Timestamp) -> Self {
        Self {
            seq: new_seq(),
            timestamp,
            retry_count: 0,
            last_attempt_at: None,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| CourierError::invalid(format!("undecodable envelope: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageOptions;

    fn platforms(names: &[&str]) -> Vec<Platform> {
        names.iter().map(|name| Platform::from(*name)).collect()
    }

    #[test]
    fn test_platform_filter_resolution() {
        let configured = platforms(&["ios", "android", "web"]);

        assert_eq!(PlatformFilter::All.resolve(&configured), configured);
        assert_eq!(
            PlatformFilter::Only(platforms(&["web", "ios", "tv"])).resolve(&configured),
            platforms(&["ios", "web"])
        );
        assert_eq!(
            PlatformFilter::Except(platforms(&["android"])).resolve(&configured),
            platforms(&["ios", "web"])
        );
        assert!(PlatformFilter::Only(vec![]).resolve(&configured).is_empty());
    }

    #[test]
    fn test_envelope_encoding_preserves_retry_state() {
        let mut envelope = Envelope::new(
            EnvelopeBody::ToUid(ToUid {
                uid: "u1".into(),
                messages: vec![Message::new("m1", MessageOptions::NEED_ACK, vec![1, 2])],
                platforms: PlatformFilter::Only(platforms(&["ios"])),
                passthrough: b"trace".to_vec(),
            }),
            Timestamp::new(1_000),
        );
        envelope.retry_count = 2;
        envelope.last_attempt_at = Some(Timestamp::new(5_000));

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.body.kind(), "to_uid");
    }

    #[test]
    fn test_unknown_variant_is_invalid() {
        let envelope = Envelope::new(
            EnvelopeBody::SendOfflineToSession(SendOfflineToSession {
                uid: "u1".into(),
                sid: "s1".into(),
            }),
            Timestamp::new(1),
        );
        let mut bytes = envelope.encode().unwrap();

        // The body tag follows the seq string, timestamp, retry count and the
        // `None` marker of last_attempt_at.
        let tag_offset = 8 + envelope.seq.len() + 8 + 4 + 1;
        bytes[tag_offset] = 9;

        let err = Envelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, CourierError::Invalid { .. }));
    }
}
