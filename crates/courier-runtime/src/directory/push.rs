//! Push producer: turns an application push request into ToUid envelopes

use crate::queue::Producer;
use courier_core::{
    new_seq, CourierError, CourierResult, Envelope, EnvelopeBody, Message, MessageOptions,
    PlatformFilter, TimeSource, ToUid, Uid,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Application push to a set of users
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    pub uids: Vec<Uid>,
    pub bodies: Vec<Vec<u8>>,
    pub options: MessageOptions,
    /// Options that replace `options` for specific users
    pub exclusive_options: HashMap<Uid, MessageOptions>,
    pub platforms: PlatformFilter,
    /// Filters that replace `platforms` for specific users
    pub exclusive_platforms: HashMap<Uid, PlatformFilter>,
    pub passthrough: Vec<u8>,
}

pub struct PushService {
    producer: Arc<dyn Producer>,
    topic: String,
    clock: Arc<dyn TimeSource>,
}

impl PushService {
    pub fn new(producer: Arc<dyn Producer>, topic: String, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            producer,
            topic,
            clock,
        }
    }

    /// Publish one ToUid envelope per user; returns the assigned message seqs
    ///
    /// Each body gets one seq shared by every recipient, so offline copies of
    /// the same body deduplicate in the offline store.
    pub async fn push(&self, request: PushRequest) -> CourierResult<Vec<String>> {
        if request.uids.is_empty() {
            return Err(CourierError::invalid("push without recipients"));
        }
        if request.bodies.is_empty() {
            return Err(CourierError::invalid("push without messages"));
        }

        let seqs: Vec<String> = request.bodies.iter().map(|_| new_seq()).collect();

        for uid in &request.uids {
            let options = request
                .exclusive_options
                .get(uid)
                .copied()
                .unwrap_or(request.options);
            let platforms = request
                .exclusive_platforms
                .get(uid)
                .cloned()
                .unwrap_or_else(|| request.platforms.clone());
            let messages = seqs
                .iter()
                .zip(&request.bodies)
                .map(|(seq, body)| Message::new(seq.clone(), options, body.clone()))
                .collect();

            let envelope = Envelope::new(
                EnvelopeBody::ToUid(ToUid {
                    uid: uid.clone(),
                    messages,
                    platforms,
                    passthrough: request.passthrough.clone(),
                }),
                self.clock.now(),
            );
            self.producer
                .publish(&self.topic, uid.as_str(), envelope.encode()?)
                .await?;
            debug!(uid = %uid, seq = %envelope.seq, "published push");
        }
        Ok(seqs)
    }
}
