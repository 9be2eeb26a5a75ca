//! Frames exchanged between a gateway session and its client

use crate::errors::{CourierError, Result};
use crate::message::{KickoutReason, Message};
use serde::{Deserialize, Serialize};

/// Client to gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Heartbeat; answered with [`ServerFrame::Pong`]
    Ping,
    /// Confirms the `Messages` frame with the given seq
    Ack { seq: String },
    /// Topic subscription, not supported by the gateway
    Subscribe { topics: Vec<String> },
}

/// Gateway to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Pong,
    Messages {
        seq: String,
        need_ack: bool,
        messages: Vec<Message>,
    },
    /// Last frame a kicked-out session receives
    Kickout { reason: KickoutReason },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| CourierError::invalid(format!("undecodable client frame: {}", err)))
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| CourierError::invalid(format!("undecodable server frame: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_frame_tag_is_invalid() {
        let err = ClientFrame::decode(&[7, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CourierError::Invalid { .. }));

        let err = ClientFrame::decode(&[]).unwrap_err();
        assert!(matches!(err, CourierError::Invalid { .. }));
    }

    #[test]
    fn test_ack_frame_carries_seq() {
        let bytes = ClientFrame::Ack { seq: "abc".into() }.encode().unwrap();
        match ClientFrame::decode(&bytes).unwrap() {
            ClientFrame::Ack { seq } => assert_eq!(seq, "abc"),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
