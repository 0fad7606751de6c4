//! Transport Port
//!
//! Narrow contract for the duplex channel to the remote connector process.
//! The session engine depends only on this interface; the concrete channel
//! (gRPC in production, in-memory for tests) is an adapter detail.
//!
//! Adapter obligations:
//!
//! - `receive` yields payloads in the order the connector produced them (FIFO).
//! - Channel closure is signalled explicitly (`Ok(None)`), never by hanging.
//! - `close` causes a concurrently blocked `receive` to resolve promptly.

use async_trait::async_trait;

pub mod channel;
pub mod grpc;

/// Raw XML text frame as delivered by the connector, before decoding.
pub type RawPayload = String;

/// Wire-ready command payload produced by the command encoder.
pub type EncodedPayload = String;

/// Channel-level failures.
///
/// Adapter-agnostic: concrete transports map their library errors into
/// these variants at the boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Operation invoked before `open` (or after `close`).
    #[error("connector channel is not open")]
    NotOpen,

    /// The channel could not be established.
    #[error("failed to reach connector: {0}")]
    Connection(String),

    /// A call on an established channel failed.
    #[error("connector call failed: {0}")]
    Call(String),

    /// The connector closed the channel.
    #[error("connector channel closed")]
    Closed,

    /// The operation did not complete within the configured deadline.
    #[error("transport operation timed out")]
    Timeout,
}

/// Duplex channel to the remote connector.
///
/// A transport instance is owned by exactly one [`Session`](crate::Session)
/// at a time. Methods take `&self`; adapters handle interior mutability so
/// the receive loop and command senders can share the instance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel to the connector.
    async fn open(&self) -> Result<(), TransportError>;

    /// Deliver one encoded command payload to the connector.
    async fn send(&self, payload: EncodedPayload) -> Result<(), TransportError>;

    /// Wait for the next raw payload.
    ///
    /// Returns `Ok(None)` when the channel has been closed in an orderly
    /// fashion (local `close` or connector shutdown).
    async fn receive(&self) -> Result<Option<RawPayload>, TransportError>;

    /// Tear the channel down, unblocking any pending `receive`.
    async fn close(&self) -> Result<(), TransportError>;
}
