//! Session Directory
//!
//! Distributed map `uid -> {sid -> "platform+gateway"}`. Entries are written
//! once (add-if-absent) and removed on disconnect or when the owning gateway
//! reports the session unknown. Reads decode entries and opportunistically
//! remove malformed ones.
//!
//! Backends implement the three raw operations of [`SessionDirectory`]; the
//! decoding, cleanup and grouping logic lives in the trait's provided methods
//! so every backend behaves the same.

pub mod coordinator;
pub mod memory;
pub mod push;
#[cfg(feature = "redis")]
pub mod redis;

pub use coordinator::DirectoryCoordinator;
pub use memory::MemoryDirectory;
pub use push::{PushRequest, PushService};
#[cfg(feature = "redis")]
pub use self::redis::RedisDirectory;

use async_trait::async_trait;
use courier_core::{CourierError, CourierResult, GatewayId, Platform, Session, Sid, Uid};
use std::collections::HashMap;
use tracing::warn;

const DETAIL_SEPARATOR: char = '+';

/// Encode the stored value of a directory entry
pub fn encode_detail(platform: &Platform, gateway_id: &GatewayId) -> String {
    format!("{}{}{}", platform, DETAIL_SEPARATOR, gateway_id)
}

/// Decode a stored value; `None` for malformed entries
pub fn decode_detail(detail: &str) -> Option<(Platform, GatewayId)> {
    let mut parts = detail.split(DETAIL_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(platform), Some(gateway), None) if !platform.is_empty() && !gateway.is_empty() => {
            Some((Platform::from(platform), GatewayId::from(gateway)))
        }
        _ => None,
    }
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Insert if `session.sid` is absent; `Ok(false)` when it already exists
    async fn add(&self, session: &Session) -> CourierResult<bool>;

    /// Remove the given sids of `uid`; absent sids are ignored
    async fn remove(&self, uid: &Uid, sids: &[Sid]) -> CourierResult<()>;

    /// Raw stored entries of `uid`, restricted to `only` when given
    async fn entries(&self, uid: &Uid, only: Option<&[Sid]>) -> CourierResult<Vec<(Sid, String)>>;

    // ------------------------------------------------------------------------
    // Provided operations
    // ------------------------------------------------------------------------

    /// Remove sessions; empty uid is invalid, empty sid list is a no-op
    async fn delete_sessions(&self, uid: &Uid, sids: &[Sid]) -> CourierResult<()> {
        if uid.is_empty() {
            return Err(CourierError::invalid("delete sessions without uid"));
        }
        if sids.is_empty() {
            return Ok(());
        }
        self.remove(uid, sids).await
    }

    /// Decoded sessions of `uid` keyed by sid
    async fn sessions(
        &self,
        uid: &Uid,
        only: Option<&[Sid]>,
    ) -> CourierResult<HashMap<Sid, Session>> {
        let mut sessions = HashMap::new();
        let mut malformed = Vec::new();

        for (sid, detail) in self.entries(uid, only).await? {
            let session = decode_detail(&detail).map(|(platform, gateway_id)| {
                Session::new(sid.clone(), uid.clone(), platform, gateway_id)
            });
            match session {
                Some(session) if session.is_valid() => {
                    sessions.insert(sid, session);
                }
                _ => malformed.push(sid),
            }
        }

        if !malformed.is_empty() {
            warn!(uid = %uid, count = malformed.len(), "removing malformed directory entries");
            if let Err(err) = self.remove(uid, &malformed).await {
                warn!(uid = %uid, error = %err, "failed to remove malformed entries");
            }
        }
        Ok(sessions)
    }

    /// One session of `uid`, if registered
    async fn session(&self, uid: &Uid, sid: &Sid) -> CourierResult<Option<Session>> {
        let only = std::slice::from_ref(sid);
        Ok(self.sessions(uid, Some(only)).await?.remove(sid))
    }

    /// Sessions grouped by platform, most recently created first
    async fn platform_sessions(&self, uid: &Uid) -> CourierResult<HashMap<Platform, Vec<Session>>> {
        let mut grouped: HashMap<Platform, Vec<Session>> = HashMap::new();
        for session in self.sessions(uid, None).await?.into_values() {
            grouped
                .entry(session.platform.clone())
                .or_default()
                .push(session);
        }
        for sessions in grouped.values_mut() {
            sessions.sort_by(|a, b| b.sid.cmp(&a.sid));
        }
        Ok(grouped)
    }
}
