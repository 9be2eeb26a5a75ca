//! Session Actor
//!
//! One actor per client connection. Producers hold a cloneable
//! [`SessionHandle`]; the connection task owns the [`SessionDriver`], which is
//! the only writer to the transport.
//!
//! Lifecycle: `Connecting -> Active -> Closing -> Closed`. Peer EOF, transport
//! errors, global shutdown and kickout all end in the same teardown, and the
//! first recorded terminal error wins.

use courier_core::{
    ClientFrame, CourierError, CourierResult, Identity, ServerFrame, Sid,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pong replies queued behind the writer
const CONTROL_CAPACITY: usize = 8;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct Shared {
    sid: Sid,
    capacity: usize,
    outbound: mpsc::Sender<ServerFrame>,
    ack_waiters: DashMap<String, oneshot::Sender<()>>,
    identity: OnceLock<Identity>,
    state: AtomicU8,
    /// `None` inside means a clean close (peer EOF or shutdown)
    terminal: OnceLock<Option<CourierError>>,
    kicked: AtomicBool,
    closing: CancellationToken,
    drained: CancellationToken,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// First write wins
    fn record(&self, err: Option<CourierError>) {
        if self.terminal.set(err).is_ok() {
            debug!(sid = %self.sid, error = ?self.terminal.get(), "session terminal state recorded");
        }
    }

    fn terminal_error(&self) -> Option<CourierError> {
        self.terminal.get().cloned().flatten()
    }

    fn closed_error(&self) -> CourierError {
        self.terminal_error()
            .unwrap_or_else(|| CourierError::session_not_found(&self.sid))
    }

    fn recv(&self, frame: ClientFrame) -> CourierResult<Option<ServerFrame>> {
        match frame {
            ClientFrame::Ping => Ok(Some(ServerFrame::Pong)),
            ClientFrame::Ack { seq } => {
                if let Some((_, waiter)) = self.ack_waiters.remove(&seq) {
                    let _ = waiter.send(());
                } else {
                    debug!(sid = %self.sid, seq = %seq, "ack without waiter");
                }
                Ok(None)
            }
            ClientFrame::Subscribe { .. } => Err(CourierError::unimplemented("subscribe")),
        }
    }
}

/// Create a session actor with an outbound buffer of `capacity` frames
pub fn session(sid: Sid, capacity: usize) -> (SessionHandle, SessionDriver) {
    let (outbound, queue) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        sid,
        capacity,
        outbound,
        ack_waiters: DashMap::new(),
        identity: OnceLock::new(),
        state: AtomicU8::new(SessionState::Connecting as u8),
        terminal: OnceLock::new(),
        kicked: AtomicBool::new(false),
        closing: CancellationToken::new(),
        drained: CancellationToken::new(),
    });
    (
        SessionHandle {
            shared: shared.clone(),
        },
        SessionDriver { shared, queue },
    )
}

// ----------------------------------------------------------------------------
// Ack Waiter
// ----------------------------------------------------------------------------

/// Registered before the frame is enqueued; deregisters itself on drop
///
/// At most one waiter exists per seq. Drop only removes the entry it owns.
struct AckWaiter {
    shared: Arc<Shared>,
    seq: String,
    receiver: oneshot::Receiver<()>,
}

impl AckWaiter {
    fn register(shared: Arc<Shared>, seq: String) -> CourierResult<Self> {
        let (sender, receiver) = oneshot::channel();
        match shared.ack_waiters.entry(seq.clone()) {
            Entry::Occupied(_) => {
                return Err(CourierError::invalid(format!("ack already pending for {}", seq)));
            }
            Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }
        Ok(Self {
            shared,
            seq,
            receiver,
        })
    }

    async fn wait(mut self, wait: Duration) -> CourierResult<()> {
        let outcome = tokio::time::timeout(wait, &mut self.receiver).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => Err(CourierError::ack_timeout(self.seq.clone(), wait)),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        self.receiver.close();
        self.shared
            .ack_waiters
            .remove_if(&self.seq, |_, sender| sender.is_closed());
    }
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

/// Cloneable producer-side handle to a session actor
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("sid", &self.shared.sid)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn sid(&self) -> &Sid {
        &self.shared.sid
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.shared.identity.get()
    }

    /// Number of sends currently waiting for an ack
    pub fn pending_acks(&self) -> usize {
        self.shared.ack_waiters.len()
    }

    pub fn terminal_error(&self) -> Option<CourierError> {
        self.shared.terminal_error()
    }

    /// Attach the authenticated identity and move to `Active`
    pub fn activate(&self, identity: Identity) {
        let _ = self.shared.identity.set(identity);
        let _ = self.shared.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Enqueue a frame without blocking
    ///
    /// A `Messages` frame with `need_ack` additionally waits up to `ack_wait`
    /// for the client's ack. A full buffer fails immediately with
    /// `Backpressure`; a closed session fails with its terminal error or
    /// `NotFound`.
    pub async fn send(&self, frame: ServerFrame, ack_wait: Duration) -> CourierResult<()> {
        if self.shared.state() >= SessionState::Closing {
            return Err(self.shared.closed_error());
        }

        let waiter = match &frame {
            ServerFrame::Messages {
                seq,
                need_ack: true,
                ..
            } => Some(AckWaiter::register(self.shared.clone(), seq.clone())?),
            _ => None,
        };

        match self.shared.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sid = %self.shared.sid, capacity = self.shared.capacity, "outbound buffer full");
                return Err(CourierError::backpressure(self.shared.capacity));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(self.shared.closed_error());
            }
        }

        match waiter {
            Some(waiter) => waiter.wait(ack_wait).await,
            None => Ok(()),
        }
    }

    /// Handle one inbound frame; returns a reply to write directly
    pub fn recv(&self, frame: ClientFrame) -> CourierResult<Option<ServerFrame>> {
        self.shared.recv(frame)
    }

    /// Terminate the session and wait until it has fully drained
    ///
    /// Only the first call records `err` and signals closing; every caller
    /// returns once teardown has completed.
    pub async fn kickout(&self, err: CourierError) {
        if !self.shared.kicked.swap(true, Ordering::SeqCst) {
            debug!(sid = %self.shared.sid, error = %err, "kicking out session");
            self.shared.record(Some(err));
            self.shared.closing.cancel();
        }
        self.shared.drained.cancelled().await;
    }

    /// Resolves once the session reached `Closed`
    pub async fn closed(&self) {
        self.shared.drained.cancelled().await;
    }
}

// ----------------------------------------------------------------------------
// Session Driver
// ----------------------------------------------------------------------------

/// Connection-side half of the actor; owns the outbound queue
pub struct SessionDriver {
    shared: Arc<Shared>,
    queue: mpsc::Receiver<ServerFrame>,
}

impl SessionDriver {
    pub fn sid(&self) -> &Sid {
        &self.shared.sid
    }

    /// Run the inbound and outbound loops until the session terminates
    ///
    /// Returns the recorded terminal error, or `Ok` for a clean close.
    pub async fn run<I, O>(
        self,
        inbound: I,
        mut outbound: O,
        shutdown: CancellationToken,
    ) -> CourierResult<()>
    where
        I: Stream<Item = CourierResult<Vec<u8>>> + Unpin + Send,
        O: Sink<Vec<u8>, Error = CourierError> + Unpin + Send,
    {
        let SessionDriver { shared, mut queue } = self;
        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_CAPACITY);

        {
            let reader = read_loop(&shared, inbound, control_tx);
            let writer = write_loop(&shared, &mut outbound, &mut queue, &mut control_rx, &shutdown);
            tokio::select! {
                _ = reader => {}
                _ = writer => {}
            }
        }

        teardown(&shared, queue, &mut outbound).await;
        match shared.terminal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tear down a session that never started running
    pub fn abort(self, err: CourierError) {
        let SessionDriver { shared, mut queue } = self;
        shared.record(Some(err));
        shared.set_state(SessionState::Closing);
        queue.close();
        shared.ack_waiters.clear();
        shared.closing.cancel();
        shared.set_state(SessionState::Closed);
        shared.drained.cancel();
    }
}

async fn read_loop<I>(shared: &Shared, mut inbound: I, control: mpsc::Sender<ServerFrame>)
where
    I: Stream<Item = CourierResult<Vec<u8>>> + Unpin,
{
    loop {
        let bytes = match inbound.next().await {
            None => {
                debug!(sid = %shared.sid, "peer closed stream");
                shared.record(None);
                return;
            }
            Some(Err(err)) => {
                shared.record(Some(err));
                return;
            }
            Some(Ok(bytes)) => bytes,
        };

        match ClientFrame::decode(&bytes).and_then(|frame| shared.recv(frame)) {
            Ok(Some(reply)) => {
                if control.send(reply).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(sid = %shared.sid, error = %err, "rejecting client frame");
                shared.record(Some(err));
                return;
            }
        }
    }
}

async fn write_loop<O>(
    shared: &Shared,
    outbound: &mut O,
    queue: &mut mpsc::Receiver<ServerFrame>,
    control: &mut mpsc::Receiver<ServerFrame>,
    shutdown: &CancellationToken,
) where
    O: Sink<Vec<u8>, Error = CourierError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.closing.cancelled() => return,
            _ = shutdown.cancelled() => {
                shared.record(None);
                return;
            }
            Some(frame) = control.recv() => frame,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                shared.record(Some(err));
                return;
            }
        };
        if let Err(err) = outbound.send(bytes).await {
            shared.record(Some(err));
            return;
        }
    }
}

async fn teardown<O>(shared: &Shared, mut queue: mpsc::Receiver<ServerFrame>, outbound: &mut O)
where
    O: Sink<Vec<u8>, Error = CourierError> + Unpin,
{
    shared.set_state(SessionState::Closing);
    // Close before clearing waiters so a racing send sees `Closed`.
    queue.close();
    shared.ack_waiters.clear();
    shared.closing.cancel();

    if let Some(CourierError::Kickout { reason }) = shared.terminal_error() {
        match (ServerFrame::Kickout { reason }).encode() {
            Ok(bytes) => {
                if let Err(err) = outbound.send(bytes).await {
                    debug!(sid = %shared.sid, error = %err, "kickout frame not delivered");
                }
            }
            Err(err) => warn!(sid = %shared.sid, error = %err, "cannot encode kickout frame"),
        }
    }
    if let Err(err) = outbound.close().await {
        debug!(sid = %shared.sid, error = %err, "closing transport failed");
    }

    shared.set_state(SessionState::Closed);
    shared.drained.cancel();
    debug!(sid = %shared.sid, "session drained");
}
