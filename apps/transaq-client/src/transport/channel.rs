//! In-Memory Transport Adapter
//!
//! Deterministic [`Transport`] backed by in-process channels, with a
//! [`ChannelRemote`] handle playing the connector side. Used by the
//! integration tests to script payload sequences and fault injection;
//! useful for any harness that needs a session without a live connector.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{EncodedPayload, RawPayload, Transport, TransportError};

type InboundItem = Result<RawPayload, TransportError>;

struct Shared {
    open: AtomicBool,
    refuse_open: AtomicBool,
    send_count: AtomicUsize,
    cancel: CancellationToken,
}

/// Build a connected transport/remote pair.
#[must_use]
pub fn pair() -> (ChannelTransport, ChannelRemote) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        open: AtomicBool::new(false),
        refuse_open: AtomicBool::new(false),
        send_count: AtomicUsize::new(0),
        cancel: CancellationToken::new(),
    });
    (
        ChannelTransport {
            shared: Arc::clone(&shared),
            sent_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        },
        ChannelRemote {
            shared,
            inbound_tx: parking_lot::Mutex::new(Some(inbound_tx)),
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        },
    )
}

/// In-memory transport endpoint handed to a session.
pub struct ChannelTransport {
    shared: Arc<Shared>,
    sent_tx: mpsc::UnboundedSender<EncodedPayload>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundItem>>,
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.shared.refuse_open.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "connector refused the channel".to_string(),
            ));
        }
        self.shared.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: EncodedPayload) -> Result<(), TransportError> {
        if !self.shared.open.load(Ordering::SeqCst) || self.shared.cancel.is_cancelled() {
            return Err(TransportError::NotOpen);
        }
        self.shared.send_count.fetch_add(1, Ordering::SeqCst);
        self.sent_tx
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<RawPayload>, TransportError> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            () = self.shared.cancel.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(payload)) => Ok(Some(payload)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
        Ok(())
    }
}

/// Connector-side handle: scripts inbound payloads and observes sends.
pub struct ChannelRemote {
    shared: Arc<Shared>,
    inbound_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<InboundItem>>>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EncodedPayload>>,
}

impl ChannelRemote {
    /// Make the next `open` fail.
    pub fn refuse_open(&self) {
        self.shared.refuse_open.store(true, Ordering::SeqCst);
    }

    /// Push one raw payload to the client.
    pub fn push(&self, payload: impl Into<RawPayload>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Ok(payload.into()));
        }
    }

    /// Inject a receive-side transport failure.
    pub fn fail(&self, error: TransportError) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// Close the inbound stream in an orderly fashion.
    pub fn close_stream(&self) {
        self.inbound_tx.lock().take();
    }

    /// Await the next payload the client sent.
    pub async fn next_sent(&self) -> Option<EncodedPayload> {
        self.sent_rx.lock().await.recv().await
    }

    /// Total number of successful `send` calls on the client side.
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.shared.send_count.load(Ordering::SeqCst)
    }
}
