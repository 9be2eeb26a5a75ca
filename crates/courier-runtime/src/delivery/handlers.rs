//! Envelope handlers
//!
//! Each handler returns `Err` when the whole envelope should be retried
//! unchanged. The fan-out handler can also ask for a narrowed retry by
//! returning the platforms that still need delivery.

use super::DeliveryContext;
use crate::offline::OfflineBatch;
use crate::rpc::GatewayClient;
use courier_core::{
    CourierError, CourierResult, KickoutSession, Message, Platform, SendOfflineToSession, Session,
    Sid, Timestamp, ToUid, Uid,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Gateway client hosting `session`; `Ok(None)` when the gateway is gone
fn gateway_for(
    context: &DeliveryContext,
    session: &Session,
) -> CourierResult<Option<Arc<dyn GatewayClient>>> {
    context.gateways.resolve(&session.gateway_id)
}

// ----------------------------------------------------------------------------
// Fan-out
// ----------------------------------------------------------------------------

/// Push outcome of one platform's sessions
#[derive(Debug, Default)]
struct PlatformPush {
    /// Sessions not reported unknown
    live: usize,
    /// Whether the most recent live session took the push
    primary_delivered: bool,
    stale: Vec<Sid>,
}

impl PlatformPush {
    /// Fold per-session results, most recent session first
    fn fold(sessions: &[Session], results: Vec<CourierResult<()>>) -> Self {
        let mut push = Self::default();
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => {
                    push.live += 1;
                    if push.live == 1 {
                        push.primary_delivered = true;
                    }
                }
                Err(err) if err.is_not_found() => push.stale.push(session.sid.clone()),
                Err(err) => {
                    debug!(sid = %session.sid, error = %err, "push failed");
                    push.live += 1;
                }
            }
        }
        push
    }
}

async fn push_to_session(
    context: &DeliveryContext,
    session: &Session,
    messages: &[Message],
) -> CourierResult<()> {
    let client = gateway_for(context, session)?.ok_or_else(|| {
        CourierError::not_found(format!("gateway {}", session.gateway_id))
    })?;
    client
        .push_messages(&session.sid, context.delivery.ack_wait(), messages.to_vec())
        .await
}

async fn push_to_platform(
    context: &DeliveryContext,
    sessions: &[Session],
    messages: &[Message],
) -> PlatformPush {
    let pushes = sessions
        .iter()
        .map(|session| push_to_session(context, session, messages));
    PlatformPush::fold(sessions, join_all(pushes).await)
}

/// Deliver a ToUid fan-out; `Some(platforms)` lists the ones to retry
pub(super) async fn to_uid(
    context: &DeliveryContext,
    retry_count: u32,
    sent_at: Timestamp,
    to_uid: &ToUid,
) -> CourierResult<Option<Vec<Platform>>> {
    let uid = &to_uid.uid;
    let targets = to_uid.platforms.resolve(&context.platforms);
    let mut grouped = context.directory.platform_sessions(uid).await?;

    let mut offline = Vec::new();
    let mut online = Vec::new();
    for platform in targets {
        match grouped.remove(&platform) {
            Some(sessions) if !sessions.is_empty() => online.push((platform, sessions)),
            _ => offline.push(platform),
        }
    }

    let pushes = online.iter().map(|(platform, sessions)| async move {
        (
            platform.clone(),
            push_to_platform(context, sessions, &to_uid.messages).await,
        )
    });

    let mut retry = Vec::new();
    let mut stale = Vec::new();
    for (platform, push) in join_all(pushes).await {
        stale.extend(push.stale);
        if push.live == 0 {
            offline.push(platform);
        } else if !push.primary_delivered {
            retry.push(platform);
        }
    }

    if !stale.is_empty() {
        debug!(uid = %uid, count = stale.len(), "removing stale sessions");
        if let Err(err) = context.directory.delete_sessions(uid, &stale).await {
            warn!(uid = %uid, error = %err, "failed to delete stale sessions");
        }
    }

    if retry_count >= context.delivery.max_retries && !retry.is_empty() {
        info!(uid = %uid, retry_count, platforms = retry.len(), "retries exhausted, storing offline instead");
        offline.append(&mut retry);
    }

    retry.extend(store_offline(context, uid, sent_at, &to_uid.messages, offline).await);

    if retry.is_empty() {
        Ok(None)
    } else {
        debug!(uid = %uid, platforms = ?retry, "fan-out incomplete");
        Ok(Some(retry))
    }
}

/// Write NEED_OFFLINE messages for each platform; returns the platforms that failed
async fn store_offline(
    context: &DeliveryContext,
    uid: &Uid,
    sent_at: Timestamp,
    messages: &[Message],
    platforms: Vec<Platform>,
) -> Vec<Platform> {
    let expire = context.offline.expire();
    let mut failed = Vec::new();
    let mut written: HashMap<Platform, i64> = HashMap::new();

    for platform in platforms {
        for message in messages.iter().filter(|message| message.needs_offline()) {
            let result = context
                .offline_store
                .write(uid, &platform, message, sent_at, expire)
                .await;
            if let Err(err) = result {
                warn!(uid = %uid, platform = %platform, seq = %message.seq, error = %err, "offline write failed");
                failed.push(platform.clone());
                break;
            }
            let max = context
                .max_offline_counts
                .get(&platform)
                .copied()
                .unwrap_or(-1);
            written.insert(platform.clone(), max);
        }
    }

    if !written.is_empty() {
        if let Err(err) = context.offline_store.clean(uid, expire, &written).await {
            warn!(uid = %uid, error = %err, "offline clean failed");
        }
    }
    failed
}

// ----------------------------------------------------------------------------
// Kickout
// ----------------------------------------------------------------------------

pub(super) async fn kickout_session(
    context: &DeliveryContext,
    kickout: &KickoutSession,
) -> CourierResult<()> {
    let Some(session) = context.directory.session(&kickout.uid, &kickout.sid).await? else {
        debug!(uid = %kickout.uid, sid = %kickout.sid, "kickout target already gone");
        return Ok(());
    };
    let Some(client) = gateway_for(context, &session)? else {
        context.forget(&session).await;
        return Ok(());
    };

    match client.kickout(&session.sid, kickout.reason).await {
        Ok(()) => {
            debug!(uid = %session.uid, sid = %session.sid, reason = %kickout.reason, "session kicked out");
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            context.forget(&session).await;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

// ----------------------------------------------------------------------------
// Offline Backlog
// ----------------------------------------------------------------------------

pub(super) async fn send_offline_to_session(
    context: &DeliveryContext,
    trigger: &SendOfflineToSession,
) -> CourierResult<()> {
    let Some(session) = context.directory.session(&trigger.uid, &trigger.sid).await? else {
        debug!(uid = %trigger.uid, sid = %trigger.sid, "offline target already gone");
        return Ok(());
    };
    let Some(client) = gateway_for(context, &session)? else {
        context.forget(&session).await;
        return Ok(());
    };

    let deadline = context.delivery.offline_push_deadline();
    match tokio::time::timeout(deadline, drain_backlog(context, &session, client.as_ref())).await {
        Ok(result) => result,
        Err(_) => Err(CourierError::unavailable(format!(
            "offline delivery to {} exceeded {:?}",
            session.sid, deadline
        ))),
    }
}

async fn drain_backlog(
    context: &DeliveryContext,
    session: &Session,
    client: &dyn GatewayClient,
) -> CourierResult<()> {
    let expire = context.offline.expire();
    let mut delivered = 0usize;

    loop {
        let batch = OfflineBatch::read(
            &context.offline_store,
            &session.uid,
            &session.platform,
            expire,
            context.offline.batch_count,
        )
        .await?;

        if batch.is_empty() {
            let purge = HashMap::from([(session.platform.clone(), -1)]);
            if let Err(err) = context.offline_store.clean(&session.uid, expire, &purge).await {
                warn!(uid = %session.uid, platform = %session.platform, error = %err, "offline clean failed");
            }
            debug!(uid = %session.uid, sid = %session.sid, delivered, "offline backlog drained");
            return Ok(());
        }

        if !batch.messages().is_empty() {
            let pushed = client
                .push_messages(
                    &session.sid,
                    context.delivery.ack_wait(),
                    batch.messages().to_vec(),
                )
                .await;
            match pushed {
                Ok(()) => delivered += batch.messages().len(),
                Err(err) if err.is_not_found() => {
                    context.forget(session).await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        batch.delete().await?;
    }
}
