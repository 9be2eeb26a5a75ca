//! Directory Coordinator
//!
//! Authenticates new connections, enforces one session per uid and platform
//! and triggers offline backlog delivery. Kickouts and backlog triggers go
//! through the queue, so this component never dials a gateway directly.

use super::SessionDirectory;
use crate::queue::Producer;
use crate::rpc::{Authenticator, Credentials, DirectoryClient};
use async_trait::async_trait;
use courier_core::{
    CourierError, CourierResult, Envelope, EnvelopeBody, GatewayId, Identity, KickoutReason,
    KickoutSession, SendOfflineToSession, Session, Sid, TimeSource, Uid,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DirectoryCoordinator {
    authenticator: Arc<dyn Authenticator>,
    directory: Arc<dyn SessionDirectory>,
    producer: Arc<dyn Producer>,
    topic: String,
    clock: Arc<dyn TimeSource>,
}

impl DirectoryCoordinator {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        directory: Arc<dyn SessionDirectory>,
        producer: Arc<dyn Producer>,
        topic: String,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            authenticator,
            directory,
            producer,
            topic,
            clock,
        }
    }

    /// Publish an envelope keyed by uid so one user's events stay ordered
    async fn publish(&self, uid: &Uid, body: EnvelopeBody) -> CourierResult<()> {
        let envelope = Envelope::new(body, self.clock.now());
        let payload = envelope.encode()?;
        self.producer
            .publish(&self.topic, uid.as_str(), payload)
            .await
    }

    async fn kickout_previous(&self, identity: &Identity) -> CourierResult<()> {
        let mut grouped = self.directory.platform_sessions(&identity.uid).await?;
        let Some(previous) = grouped.remove(&identity.platform) else {
            return Ok(());
        };

        for session in previous {
            debug!(uid = %identity.uid, sid = %session.sid, "kicking out previous session");
            let body = EnvelopeBody::KickoutSession(KickoutSession {
                uid: identity.uid.clone(),
                sid: session.sid,
                reason: KickoutReason::DuplicatePlatformLogin,
            });
            if let Err(err) = self.publish(&identity.uid, body).await {
                warn!(uid = %identity.uid, error = %err, "failed to publish kickout");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for DirectoryCoordinator {
    async fn connect(
        &self,
        credentials: &Credentials,
        gateway_id: &GatewayId,
        sid: &Sid,
    ) -> CourierResult<Identity> {
        let identity = self.authenticator.authenticate(credentials).await?;
        if identity.uid.is_empty() || identity.platform.is_empty() {
            return Err(CourierError::internal(
                "authenticator returned an incomplete identity",
            ));
        }

        self.kickout_previous(&identity).await?;

        let session = Session::new(
            sid.clone(),
            identity.uid.clone(),
            identity.platform.clone(),
            gateway_id.clone(),
        );
        if !self.directory.add(&session).await? {
            warn!(uid = %identity.uid, sid = %sid, "session already registered");
        }

        let body = EnvelopeBody::SendOfflineToSession(SendOfflineToSession {
            uid: identity.uid.clone(),
            sid: sid.clone(),
        });
        if let Err(err) = self.publish(&identity.uid, body).await {
            warn!(uid = %identity.uid, sid = %sid, error = %err, "failed to trigger offline delivery");
        }

        info!(uid = %identity.uid, platform = %identity.platform, sid = %sid, gateway = %gateway_id, "session connected");
        Ok(identity)
    }

    async fn disconnect(&self, gateway_id: &GatewayId, sid: &Sid, uid: &Uid) -> CourierResult<()> {
        debug!(uid = %uid, sid = %sid, gateway = %gateway_id, "session disconnected");
        self.directory
            .delete_sessions(uid, std::slice::from_ref(sid))
            .await
    }
}
