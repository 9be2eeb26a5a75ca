//! Gateway Service
//!
//! Hosts the session actors of one gateway process. `serve` runs a client
//! connection from directory registration to teardown; `push_messages` and
//! `kickout` are the calls the delivery coordinator makes through
//! [`GatewayClient`].

pub mod registry;
pub mod resolver;
pub mod session;

pub use registry::SessionRegistry;
pub use resolver::GatewayTable;
pub use session::{session, SessionDriver, SessionHandle, SessionState};

use crate::rpc::{Credentials, DirectoryClient, GatewayClient};
use async_trait::async_trait;
use courier_core::{
    new_seq, CourierError, CourierResult, GatewayConfig, GatewayId, KickoutReason, Message,
    ServerFrame, Sid,
};
use futures::{Sink, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Gateway
// ----------------------------------------------------------------------------

struct GatewayInner {
    id: GatewayId,
    config: GatewayConfig,
    registry: SessionRegistry,
    directory: Arc<dyn DirectoryClient>,
    shutdown: CancellationToken,
}

/// One gateway process; cheap to clone
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(id: GatewayId, config: GatewayConfig, directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                id,
                config,
                registry: SessionRegistry::new(),
                directory,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &GatewayId {
        &self.inner.id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Run one client connection to completion
    ///
    /// The session is registered locally before the directory learns about
    /// it, so pushes triggered by `Connect` (the offline backlog) find it.
    pub async fn serve<I, O>(&self, credentials: Credentials, inbound: I, outbound: O) -> CourierResult<()>
    where
        I: Stream<Item = CourierResult<Vec<u8>>> + Unpin + Send,
        O: Sink<Vec<u8>, Error = CourierError> + Unpin + Send,
    {
        let inner = &self.inner;
        let sid = Sid::generate();
        let (handle, driver) = session(sid.clone(), inner.config.outbound_capacity);
        inner.registry.insert(handle.clone());

        let identity = match inner.directory.connect(&credentials, &inner.id, &sid).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(sid = %sid, error = %err, "directory rejected connection");
                inner.registry.remove(&sid);
                driver.abort(err.clone());
                return Err(err);
            }
        };
        handle.activate(identity.clone());
        info!(sid = %sid, uid = %identity.uid, platform = %identity.platform, "session active");

        let result = driver
            .run(inbound, outbound, inner.shutdown.child_token())
            .await;

        inner.registry.remove(&sid);
        if let Err(err) = inner
            .directory
            .disconnect(&inner.id, &sid, &identity.uid)
            .await
        {
            warn!(sid = %sid, uid = %identity.uid, error = %err, "directory disconnect failed");
        }

        match &result {
            Ok(()) => info!(sid = %sid, uid = %identity.uid, "session closed"),
            Err(err) => info!(sid = %sid, uid = %identity.uid, error = %err, "session terminated"),
        }
        result
    }

    /// Push messages to one session as a single frame
    pub async fn push_messages(
        &self,
        sid: &Sid,
        ack_wait: Duration,
        messages: Vec<Message>,
    ) -> CourierResult<()> {
        let handle = self
            .inner
            .registry
            .get(sid)
            .ok_or_else(|| CourierError::session_not_found(sid))?;
        if messages.is_empty() {
            return Ok(());
        }

        let need_ack = messages.iter().any(Message::needs_ack);
        let frame = ServerFrame::Messages {
            seq: new_seq(),
            need_ack,
            messages,
        };
        debug!(sid = %sid, need_ack, "pushing messages");
        handle.send(frame, ack_wait).await
    }

    /// Kick a session out and wait for its teardown
    pub async fn kickout(&self, sid: &Sid, reason: KickoutReason) -> CourierResult<()> {
        let handle = self
            .inner
            .registry
            .get(sid)
            .ok_or_else(|| CourierError::session_not_found(sid))?;
        info!(sid = %sid, reason = %reason, "kicking out session");
        handle.kickout(CourierError::Kickout { reason }).await;
        Ok(())
    }

    /// Room broadcast is not supported
    pub async fn broadcast_room(&self, room: &str, _messages: Vec<Message>) -> CourierResult<()> {
        Err(CourierError::unimplemented(format!("broadcast to room {}", room)))
    }

    /// Cancel every session and wait for all of them to drain
    pub async fn shutdown(&self) {
        info!(gateway = %self.inner.id, sessions = self.inner.registry.len(), "gateway shutting down");
        self.inner.shutdown.cancel();
        for handle in self.inner.registry.snapshot() {
            handle.closed().await;
        }
    }
}

#[async_trait]
impl GatewayClient for Gateway {
    async fn push_messages(
        &self,
        sid: &Sid,
        ack_wait: Duration,
        messages: Vec<Message>,
    ) -> CourierResult<()> {
        Gateway::push_messages(self, sid, ack_wait, messages).await
    }

    async fn kickout(&self, sid: &Sid, reason: KickoutReason) -> CourierResult<()> {
        Gateway::kickout(self, sid, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ClientFrame, Identity, MessageOptions, Uid};
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Directory double that accepts everyone as u1/ios and records calls
    #[derive(Default)]
    struct RecordingDirectory {
        reject: bool,
        connects: Mutex<Vec<Sid>>,
        disconnects: Mutex<Vec<(Sid, Uid)>>,
    }

    #[async_trait]
    impl DirectoryClient for RecordingDirectory {
        async fn connect(
            &self,
            _credentials: &Credentials,
            _gateway_id: &GatewayId,
            sid: &Sid,
        ) -> CourierResult<Identity> {
            if self.reject {
                return Err(CourierError::unauthenticated("rejected"));
            }
            self.connects.lock().unwrap().push(sid.clone());
            Ok(Identity::new("u1", "ios"))
        }

        async fn disconnect(&self, _gateway_id: &GatewayId, sid: &Sid, uid: &Uid) -> CourierResult<()> {
            self.disconnects.lock().unwrap().push((sid.clone(), uid.clone()));
            Ok(())
        }
    }

    fn create_test_gateway(directory: Arc<RecordingDirectory>) -> Gateway {
        Gateway::new("gw-1".into(), GatewayConfig::default(), directory)
    }

    struct Client {
        inbound: fmpsc::UnboundedSender<CourierResult<Vec<u8>>>,
        outbound: fmpsc::UnboundedReceiver<Vec<u8>>,
        task: tokio::task::JoinHandle<CourierResult<()>>,
    }

    async fn connect_client(gateway: &Gateway) -> (Client, Sid) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let sink = out_tx.sink_map_err(|_| CourierError::unavailable("client gone"));
        let serving = gateway.clone();
        let task = tokio::spawn(async move { serving.serve(Credentials::new(), in_rx, sink).await });

        let sid = timeout(Duration::from_millis(200), async {
            loop {
                if let Some(handle) = gateway.registry().snapshot().into_iter().find(|h| h.state() == SessionState::Active) {
                    return handle.sid().clone();
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session becomes active");

        (
            Client {
                inbound: in_tx,
                outbound: out_rx,
                task,
            },
            sid,
        )
    }

    #[tokio::test]
    async fn test_push_to_unknown_session_is_not_found() {
        let gateway = create_test_gateway(Arc::new(RecordingDirectory::default()));
        let err = gateway
            .push_messages(&Sid::from("missing"), Duration::from_millis(10), vec![])
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = gateway
            .kickout(&Sid::from("missing"), KickoutReason::Requested)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_push_sets_need_ack_from_any_message() {
        let directory = Arc::new(RecordingDirectory::default());
        let gateway = create_test_gateway(directory.clone());
        let (mut client, sid) = connect_client(&gateway).await;

        // Empty pushes succeed without touching the transport.
        gateway
            .push_messages(&sid, Duration::from_millis(10), vec![])
            .await
            .unwrap();

        let pusher = gateway.clone();
        let push_sid = sid.clone();
        let push = tokio::spawn(async move {
            pusher
                .push_messages(
                    &push_sid,
                    Duration::from_secs(1),
                    vec![
                        Message::new("m1", MessageOptions::NONE, vec![1]),
                        Message::new("m2", MessageOptions::NEED_ACK, vec![2]),
                    ],
                )
                .await
        });

        let bytes = timeout(Duration::from_millis(200), client.outbound.next())
            .await
            .unwrap()
            .unwrap();
        match ServerFrame::decode(&bytes).unwrap() {
            ServerFrame::Messages { seq, need_ack, messages } => {
                assert!(need_ack);
                assert_eq!(messages.len(), 2);
                client
                    .inbound
                    .unbounded_send(Ok(ClientFrame::Ack { seq }.encode().unwrap()))
                    .unwrap();
            }
            other => panic!("unexpected frame {:?}", other),
        }
        push.await.unwrap().unwrap();
        assert_eq!(directory.connects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kickout_disconnects_from_directory() {
        let directory = Arc::new(RecordingDirectory::default());
        let gateway = create_test_gateway(directory.clone());
        let (client, sid) = connect_client(&gateway).await;

        gateway
            .kickout(&sid, KickoutReason::DuplicatePlatformLogin)
            .await
            .unwrap();

        let result = timeout(Duration::from_millis(200), client.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CourierError::Kickout { .. })));
        assert!(gateway.registry().get(&sid).is_none());
        assert_eq!(
            directory.disconnects.lock().unwrap().as_slice(),
            &[(sid, Uid::from("u1"))]
        );
    }

    #[tokio::test]
    async fn test_rejected_connect_tears_down() {
        let directory = Arc::new(RecordingDirectory {
            reject: true,
            ..Default::default()
        });
        let gateway = create_test_gateway(directory.clone());
        let (_in_tx, in_rx) = fmpsc::unbounded::<CourierResult<Vec<u8>>>();
        let (out_tx, _out_rx) = fmpsc::unbounded();
        let sink = out_tx.sink_map_err(|_| CourierError::unavailable("client gone"));

        let err = gateway.serve(Credentials::new(), in_rx, sink).await.unwrap_err();
        assert!(matches!(err, CourierError::Unauthenticated { .. }));
        assert!(gateway.registry().is_empty());
        assert!(directory.disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_sessions() {
        let gateway = create_test_gateway(Arc::new(RecordingDirectory::default()));
        let (first, _) = connect_client(&gateway).await;

        timeout(Duration::from_millis(200), gateway.shutdown())
            .await
            .expect("shutdown completes");
        let result = first.task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_room_is_unimplemented() {
        let gateway = create_test_gateway(Arc::new(RecordingDirectory::default()));
        let err = gateway.broadcast_room("lobby", vec![]).await.unwrap_err();
        assert!(matches!(err, CourierError::Unimplemented { .. }));
    }
}
