//! Delivery Coordinator
//!
//! Consumes envelopes from the primary and retry topics and turns them into
//! gateway pushes, kickouts and offline writes. [`process`] handles one
//! envelope and reports whether it is finished or must be republished;
//! [`DeliveryService`] runs the consuming workers and routes retries.

mod handlers;
pub mod workers;

pub use workers::DeliveryService;

use crate::directory::SessionDirectory;
use crate::offline::OfflineStore;
use crate::rpc::GatewayResolver;
use courier_core::{
    CourierConfig, CourierResult, DeliveryConfig, Envelope, EnvelopeBody, OfflineConfig,
    Platform, PlatformFilter, Session, TimeSource,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

// ----------------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------------

/// Collaborators and settings shared by every delivery worker
pub struct DeliveryContext {
    delivery: DeliveryConfig,
    offline: OfflineConfig,
    platforms: Vec<Platform>,
    max_offline_counts: HashMap<Platform, i64>,
    directory: Arc<dyn SessionDirectory>,
    offline_store: Arc<dyn OfflineStore>,
    gateways: Arc<dyn GatewayResolver>,
    clock: Arc<dyn TimeSource>,
}

impl DeliveryContext {
    pub fn new(
        config: &CourierConfig,
        directory: Arc<dyn SessionDirectory>,
        offline_store: Arc<dyn OfflineStore>,
        gateways: Arc<dyn GatewayResolver>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            delivery: config.delivery.clone(),
            offline: config.offline.clone(),
            platforms: config.platform_names(),
            max_offline_counts: config.max_offline_counts(),
            directory,
            offline_store,
            gateways,
            clock,
        }
    }

    pub fn delivery_config(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// Drop a session the gateway no longer knows about
    async fn forget(&self, session: &Session) {
        let sids = std::slice::from_ref(&session.sid);
        if let Err(err) = self.directory.delete_sessions(&session.uid, sids).await {
            warn!(uid = %session.uid, sid = %session.sid, error = %err, "failed to delete stale session");
        }
    }
}

// ----------------------------------------------------------------------------
// Processing
// ----------------------------------------------------------------------------

/// Result of handling one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fully handled; the delivery can be acked
    Done,
    /// Must be republished; carries the (possibly narrowed) envelope
    Retry(Envelope),
    /// Failed in a way redelivery cannot fix; goes straight to the DLQ
    DeadLetter(Envelope),
}

/// Handle one envelope; a panicking handler yields a retry of the original
pub async fn process(context: &DeliveryContext, envelope: Envelope) -> Outcome {
    let original = envelope.clone();
    match AssertUnwindSafe(dispatch(context, envelope)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(seq = %original.seq, kind = original.body.kind(), "handler panicked, scheduling retry");
            Outcome::Retry(original)
        }
    }
}

async fn dispatch(context: &DeliveryContext, mut envelope: Envelope) -> Outcome {
    let result: CourierResult<Option<Vec<Platform>>> = match &envelope.body {
        EnvelopeBody::ToUid(to_uid) => {
            handlers::to_uid(context, envelope.retry_count, envelope.timestamp, to_uid).await
        }
        EnvelopeBody::KickoutSession(kickout) => handlers::kickout_session(context, kickout)
            .await
            .map(|()| None),
        EnvelopeBody::SendOfflineToSession(trigger) => {
            handlers::send_offline_to_session(context, trigger)
                .await
                .map(|()| None)
        }
    };

    match result {
        Ok(None) => Outcome::Done,
        Ok(Some(platforms)) => {
            if let EnvelopeBody::ToUid(to_uid) = &mut envelope.body {
                to_uid.platforms = PlatformFilter::Only(platforms);
            }
            Outcome::Retry(envelope)
        }
        Err(err) if err.is_retryable() => {
            warn!(seq = %envelope.seq, kind = envelope.body.kind(), error = %err, "delivery failed, scheduling retry");
            Outcome::Retry(envelope)
        }
        Err(err) => {
            error!(seq = %envelope.seq, kind = envelope.body.kind(), error = %err, "delivery failed permanently");
            Outcome::DeadLetter(envelope)
        }
    }
}
