//! Session and Dispatch Engine
//!
//! Owns the connector channel for its lifetime and turns the raw inbound
//! stream into ordered, typed handler invocations.
//!
//! # Lifecycle
//!
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
//! A session is terminal once disconnected (by request or by link loss);
//! reconnection means constructing a new session over a fresh transport.
//!
//! # Dispatch guarantees
//!
//! - Messages are delivered in transport arrival order.
//! - Delivery is non-reentrant: invocation N+1 never starts before N returns.
//! - A payload that fails to decode is dropped and reported through
//!   `on_decode_error`; the stream continues.
//! - A receive-side transport failure produces exactly one transition to
//!   `Disconnected` and exactly one `on_session_lost`.
//! - Handler panics are contained and logged; they never kill the loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{DecodeError, decode};
use crate::commands::{Command, EncodeError};
use crate::config::{ClientSettings, ConnectParams};
use crate::messages::TransaqMessage;
use crate::transport::{RawPayload, Transport, TransportError};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channel; initial and terminal state.
    Disconnected,
    /// Channel opening, waiting for the connector's acknowledgement.
    Connecting,
    /// Live: commands allowed, messages flowing.
    Connected,
    /// Orderly teardown in progress.
    Disconnecting,
}

/// Session-level failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation is not legal in the current state.
    #[error("operation `{operation}` is invalid in {state:?} state")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// Connection establishment failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Lifecycle commands go through `connect`/`disconnect`, not
    /// `send_command`.
    #[error("`{0}` is managed by the session lifecycle")]
    LifecycleCommand(&'static str),

    /// Command construction or serialization failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receiver of the decoded message stream.
///
/// Invoked from the session's receive-loop task, one call at a time, in
/// arrival order. Implementations must not block for long; they may call
/// [`Session::send_command`] (the send path does not depend on
/// receive-path progress).
pub trait MessageHandler: Send + Sync {
    /// One decoded message. The session keeps nothing after this call.
    fn on_message(&self, message: TransaqMessage);

    /// A payload failed to decode and was dropped. The stream continues.
    fn on_decode_error(&self, error: &DecodeError, raw: &RawPayload) {
        warn!(%error, raw, "dropped undecodable payload");
    }

    /// The channel failed while the session was live (or after the connect
    /// acknowledgement had already been accepted). The session is now
    /// `Disconnected`; called exactly once.
    fn on_session_lost(&self, error: &TransportError) {
        warn!(%error, "session lost");
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    settings: ClientSettings,
    state: parking_lot::Mutex<SessionState>,
    // Set on any path out of the session; connect refuses to run again.
    terminated: AtomicBool,
    // Diagnostic correlation only; the connector does not echo it.
    command_seq: AtomicU64,
    cancel: CancellationToken,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    connect_signal: parking_lot::Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

/// One client session over one transport instance.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session over `transport`, dispatching to `handler`.
    ///
    /// The transport must be exclusively owned by this session; the handler
    /// may be shared with the rest of the application.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                handler,
                settings,
                state: parking_lot::Mutex::new(SessionState::Disconnected),
                terminated: AtomicBool::new(false),
                command_seq: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                loop_handle: parking_lot::Mutex::new(None),
                connect_signal: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Open the channel, submit the connect command, and wait for the
    /// connector's acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] when not `Disconnected` or the
    ///   session has already run.
    /// - [`SessionError::ConnectFailed`] when the channel cannot be opened,
    ///   the connector reports a login failure, or the acknowledgement does
    ///   not arrive within `connect_timeout`. The session returns to
    ///   `Disconnected`.
    pub async fn connect(&self, params: ConnectParams) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Disconnected
                || self.inner.terminated.load(Ordering::SeqCst)
            {
                return Err(SessionError::InvalidState {
                    operation: "connect",
                    state: *state,
                });
            }
            *state = SessionState::Connecting;
        }
        info!(login = params.login(), "connecting");

        // Channel-open failure leaves the session reusable: nothing has
        // been spawned yet.
        if let Err(open_error) = self.inner.transport.open().await {
            *self.inner.state.lock() = SessionState::Disconnected;
            return Err(SessionError::ConnectFailed(open_error.to_string()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.inner.connect_signal.lock() = Some(ack_tx);

        let loop_inner = Arc::clone(&self.inner);
        *self.inner.loop_handle.lock() =
            Some(tokio::spawn(async move { receive_loop(loop_inner).await }));

        let payload = match Command::Connect(params).encode() {
            Ok(payload) => payload,
            Err(encode_error) => {
                return Err(self.abort_connect(encode_error.to_string()).await);
            }
        };
        let send = tokio::time::timeout(
            self.inner.settings.send_timeout,
            self.inner.transport.send(payload),
        )
        .await;
        match send {
            Ok(Ok(())) => {}
            Ok(Err(send_error)) => {
                return Err(self.abort_connect(send_error.to_string()).await);
            }
            Err(_elapsed) => {
                return Err(self.abort_connect(TransportError::Timeout.to_string()).await);
            }
        }

        match tokio::time::timeout(self.inner.settings.connect_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                // The loop (on link loss) or a concurrent disconnect may have
                // moved the state since the ack was dispatched; only a session
                // still in Connecting goes live.
                let went_live = {
                    let mut state = self.inner.state.lock();
                    if *state == SessionState::Connecting {
                        *state = SessionState::Connected;
                        true
                    } else {
                        false
                    }
                };
                if went_live {
                    info!("connected");
                    Ok(())
                } else {
                    Err(self
                        .abort_connect("link lost before the session went live".to_string())
                        .await)
                }
            }
            Ok(Ok(Err(reason))) => Err(self.abort_connect(reason).await),
            Ok(Err(_dropped)) => {
                Err(self
                    .abort_connect("session closed before acknowledgement".to_string())
                    .await)
            }
            Err(_elapsed) => {
                Err(self
                    .abort_connect("timed out waiting for connector acknowledgement".to_string())
                    .await)
            }
        }
    }

    /// Encode and submit one command.
    ///
    /// Send failures are surfaced to the caller and do not change session
    /// state; the receive loop is the sole authority on link loss.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] when not `Connected` (no transport
    ///   I/O is performed).
    /// - [`SessionError::LifecycleCommand`] for `Connect`/`Disconnect`.
    /// - [`SessionError::Transport`] when the send fails or exceeds
    ///   `send_timeout`.
    pub async fn send_command(&self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Connect(_) | Command::Disconnect => {
                return Err(SessionError::LifecycleCommand(command.id()));
            }
            _ => {}
        }
        {
            let state = self.inner.state.lock();
            if *state != SessionState::Connected {
                return Err(SessionError::InvalidState {
                    operation: "send_command",
                    state: *state,
                });
            }
        }

        let seq = self.inner.command_seq.fetch_add(1, Ordering::Relaxed);
        let payload = command.encode()?;
        debug!(seq, command = command.id(), "sending command");

        match tokio::time::timeout(
            self.inner.settings.send_timeout,
            self.inner.transport.send(payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(send_error)) => Err(send_error.into()),
            Err(_elapsed) => Err(TransportError::Timeout.into()),
        }
    }

    /// Tear the session down.
    ///
    /// Sends the disconnect command best-effort, stops the receive loop,
    /// and closes the transport. Idempotent; a pending `receive` unblocks
    /// promptly. The session is terminal afterwards.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the signature leaves room for
    /// transports whose teardown can fail.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let was_connected = {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Disconnected | SessionState::Disconnecting => return Ok(()),
                current => {
                    let was = current == SessionState::Connected;
                    *state = SessionState::Disconnecting;
                    was
                }
            }
        };
        self.inner.terminated.store(true, Ordering::SeqCst);
        // A connect parked on the ack must fail now, not at its timeout.
        self.inner.connect_signal.lock().take();
        info!("disconnecting");

        // Best-effort farewell; the connector also handles abrupt closes.
        if was_connected {
            match Command::Disconnect.encode() {
                Ok(payload) => {
                    let sent = tokio::time::timeout(
                        self.inner.settings.send_timeout,
                        self.inner.transport.send(payload),
                    )
                    .await;
                    if let Ok(Err(send_error)) = sent {
                        debug!(%send_error, "disconnect command not delivered");
                    } else if sent.is_err() {
                        debug!("disconnect command timed out");
                    }
                }
                Err(encode_error) => debug!(%encode_error, "disconnect command not encodable"),
            }
        }

        self.inner.cancel.cancel();
        if let Err(close_error) = self.inner.transport.close().await {
            debug!(%close_error, "transport close reported an error");
        }
        let handle = self.inner.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        *self.inner.state.lock() = SessionState::Disconnected;
        info!("disconnected");
        Ok(())
    }

    /// Teardown after a failed connect attempt past the loop spawn.
    async fn abort_connect(&self, reason: String) -> SessionError {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.connect_signal.lock().take();
        self.inner.cancel.cancel();
        if let Err(close_error) = self.inner.transport.close().await {
            debug!(%close_error, "transport close reported an error");
        }
        let handle = self.inner.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.inner.state.lock() = SessionState::Disconnected;
        SessionError::ConnectFailed(reason)
    }
}

// =============================================================================
// Receive loop
// =============================================================================

async fn receive_loop(inner: Arc<SessionInner>) {
    loop {
        let received = tokio::select! {
            () = inner.cancel.cancelled() => break,
            received = inner.transport.receive() => received,
        };
        match received {
            Ok(Some(raw)) => dispatch(&inner, raw),
            Ok(None) => {
                // Orderly closure is loss unless we asked for it.
                if *inner.state.lock() == SessionState::Disconnecting
                    || inner.cancel.is_cancelled()
                {
                    break;
                }
                handle_loss(&inner, &TransportError::Closed);
                break;
            }
            Err(receive_error) => {
                handle_loss(&inner, &receive_error);
                break;
            }
        }
    }
    debug!("receive loop stopped");
}

fn dispatch(inner: &SessionInner, raw: RawPayload) {
    let message = match decode(&raw) {
        Ok(message) => message,
        Err(decode_error) => {
            let handler = &inner.handler;
            if catch_unwind(AssertUnwindSafe(|| {
                handler.on_decode_error(&decode_error, &raw);
            }))
            .is_err()
            {
                error!("handler panicked in on_decode_error");
            }
            return;
        }
    };

    // Resolve a pending connect before the handler sees the message.
    match &message {
        TransaqMessage::ConnectAck(_) => {
            if let Some(signal) = inner.connect_signal.lock().take() {
                let _ = signal.send(Ok(()));
            }
        }
        TransaqMessage::DisconnectNotice(status) => {
            if let Some(signal) = inner.connect_signal.lock().take() {
                let reason = status
                    .error_text()
                    .unwrap_or("connector reported disconnected")
                    .to_string();
                let _ = signal.send(Err(reason));
            }
        }
        _ => {}
    }

    let kind = message.kind();
    let handler = &inner.handler;
    if catch_unwind(AssertUnwindSafe(|| handler.on_message(message))).is_err() {
        error!(kind, "handler panicked in on_message");
    }
}

fn handle_loss(inner: &SessionInner, loss: &TransportError) {
    let previous = {
        let mut state = inner.state.lock();
        std::mem::replace(&mut *state, SessionState::Disconnected)
    };
    inner.terminated.store(true, Ordering::SeqCst);
    match previous {
        SessionState::Connected => {
            warn!(error = %loss, "connector channel lost");
            let handler = &inner.handler;
            if catch_unwind(AssertUnwindSafe(|| handler.on_session_lost(loss))).is_err() {
                error!("handler panicked in on_session_lost");
            }
        }
        SessionState::Connecting => {
            let signal = inner.connect_signal.lock().take();
            if let Some(signal) = signal {
                let _ = signal.send(Err(loss.to_string()));
            } else {
                // Ack already dispatched: the connect caller may have gone
                // (or be about to go) live, so this is a lost session.
                warn!(error = %loss, "connector channel lost");
                let handler = &inner.handler;
                if catch_unwind(AssertUnwindSafe(|| handler.on_session_lost(loss))).is_err() {
                    error!("handler panicked in on_session_lost");
                }
            }
        }
        SessionState::Disconnecting | SessionState::Disconnected => {}
    }
}
