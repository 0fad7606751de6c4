#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Transaq Client - Connector Session Library
//!
//! Async client for the out-of-process TRANSAQ connector bridge. The
//! connector speaks the broker's XML protocol and exposes it over a small
//! gRPC service; this crate owns the session lifecycle, encodes typed
//! commands into that XML, and dispatches the decoded server message
//! stream to caller-supplied handling logic.
//!
//! # Layers (inside → outside)
//!
//! - **Model**: pure data and codecs
//!   - `messages`: typed server message variants
//!   - `codec`: XML decode table and element plumbing
//!   - `commands`: validated outgoing commands and their encoding
//!
//! - **Engine**:
//!   - `session`: lifecycle state machine, receive loop, ordered dispatch
//!   - `config`: session settings and broker credentials
//!
//! - **Adapters**:
//!   - `transport`: the duplex channel contract
//!   - `transport::grpc`: production adapter over the connector service
//!   - `transport::channel`: deterministic in-memory adapter
//!
//! # Data Flow
//!
//! ```text
//! Command ──encode──► Transport ──gRPC──► connector ──► TRANSAQ server
//!                                            │
//! MessageHandler ◄──dispatch── decode ◄──────┘ (XML payload stream)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use transaq_client::{
//!     ClientSettings, Command, ConnectParams, MessageHandler, Security, Session,
//!     TransaqMessage, transport::grpc::GrpcTransport,
//! };
//!
//! struct Printer;
//! impl MessageHandler for Printer {
//!     fn on_message(&self, message: TransaqMessage) {
//!         println!("{message:?}");
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ClientSettings::default();
//! let transport = Arc::new(GrpcTransport::new(
//!     "http://127.0.0.1:50051",
//!     settings.inbound_capacity,
//! ));
//! let session = Session::new(transport, Arc::new(Printer), settings);
//!
//! session.connect(ConnectParams::new("TCNN1234", "secret")?).await?;
//! let gazp = Security::new("TQBR", "GAZP")?;
//! session.send_command(Command::GetSecurityInfo { security: gazp }).await?;
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

pub mod codec;
pub mod commands;
pub mod config;
pub mod messages;
pub mod session;
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::{DecodeError, decode};
pub use commands::{Command, EncodeError, OrderParams, Security, UnfilledPolicy};
pub use config::{ClientSettings, ConfigError, ConnectParams};
pub use messages::{
    Candle, CandlePacket, CandleStatus, ClientAccount, CommandResult, ConnectorStatus, Market, Order,
    OrderState, OwnTrade, Quotation, SecurityInfo, ServerError, ServerStatus, Side, TickTrade,
    TransaqMessage,
};
pub use session::{MessageHandler, Session, SessionError, SessionState};
pub use transport::{EncodedPayload, RawPayload, Transport, TransportError};
