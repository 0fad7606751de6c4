//! gRPC Transport Adapter
//!
//! Concrete [`Transport`] over the connector's gRPC contract:
//!
//! - `transaqConnector.ConnectService/SendCommand` — unary; the reply
//!   carries the connector's immediate result XML for the command.
//! - `transaqConnector.ConnectService/FetchResponseData` — server stream
//!   of asynchronous XML payloads.
//!
//! The proto contract is two string-carrying messages; the types are
//! written out with `prost` derives and called through
//! `tonic::client::Grpc` directly.
//!
//! A pump task moves stream payloads into a bounded channel that
//! `receive` drains. Unary replies are forwarded into the same channel,
//! so command results reach the caller as ordinary inbound messages.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EncodedPayload, RawPayload, Transport, TransportError};

// =============================================================================
// Wire messages (package transaqConnector, service ConnectService)
// =============================================================================

/// `SendCommand` request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SendCommandRequest {
    /// Command XML.
    #[prost(string, tag = "1")]
    pub message: String,
}

/// `SendCommand` reply.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SendCommandResponse {
    /// Result XML for the submitted command.
    #[prost(string, tag = "1")]
    pub message: String,
}

/// `FetchResponseData` request. Carries nothing.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DataRequest {}

/// One server-pushed stream entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataResponse {
    /// Raw XML payload.
    #[prost(string, tag = "1")]
    pub message: String,
}

const SEND_COMMAND_PATH: &str = "/transaqConnector.ConnectService/SendCommand";
const FETCH_RESPONSE_DATA_PATH: &str = "/transaqConnector.ConnectService/FetchResponseData";

/// Thin client over the connector's two RPCs.
#[derive(Debug, Clone)]
pub struct ConnectorClient {
    inner: tonic::client::Grpc<tonic::transport::Channel>,
}

impl ConnectorClient {
    /// Dial the connector endpoint (e.g. `http://127.0.0.1:50051`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] when the endpoint is invalid
    /// or unreachable.
    pub async fn connect(endpoint: String) -> Result<Self, TransportError> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint)
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    /// Submit one command, returning the connector's result XML.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Call`] when the RPC fails.
    pub async fn send_command(&mut self, message: String) -> Result<String, TransportError> {
        self.inner
            .ready()
            .await
            .map_err(|e| TransportError::Call(e.to_string()))?;
        let codec = tonic_prost::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(SEND_COMMAND_PATH);
        let response: tonic::Response<SendCommandResponse> = self
            .inner
            .unary(tonic::Request::new(SendCommandRequest { message }), path, codec)
            .await
            .map_err(|status| TransportError::Call(status.to_string()))?;
        Ok(response.into_inner().message)
    }

    /// Open the asynchronous payload stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Call`] when the RPC fails.
    pub async fn fetch_response_data(
        &mut self,
    ) -> Result<tonic::Streaming<DataResponse>, TransportError> {
        self.inner
            .ready()
            .await
            .map_err(|e| TransportError::Call(e.to_string()))?;
        let codec = tonic_prost::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(FETCH_RESPONSE_DATA_PATH);
        let response = self
            .inner
            .server_streaming(tonic::Request::new(DataRequest {}), path, codec)
            .await
            .map_err(|status| TransportError::Call(status.to_string()))?;
        Ok(response.into_inner())
    }
}

type InboundItem = Result<RawPayload, TransportError>;

/// [`Transport`] implementation over the connector's gRPC service.
pub struct GrpcTransport {
    endpoint: String,
    inbound_capacity: usize,
    client: parking_lot::Mutex<Option<ConnectorClient>>,
    inbound_tx: parking_lot::Mutex<Option<mpsc::Sender<InboundItem>>>,
    // Async mutex: `receive` holds it across the await.
    inbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<InboundItem>>>,
    cancel: CancellationToken,
}

impl GrpcTransport {
    /// Create an adapter for the given connector endpoint. The channel is
    /// dialed on `open`, not here.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, inbound_capacity: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            inbound_capacity: inbound_capacity.max(1),
            client: parking_lot::Mutex::new(None),
            inbound_tx: parking_lot::Mutex::new(None),
            inbound_rx: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn pump(
        mut stream: tonic::Streaming<DataResponse>,
        tx: mpsc::Sender<InboundItem>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = stream.message() => next,
            };
            match next {
                Ok(Some(data)) => {
                    if tx.send(Ok(data.message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("connector stream ended");
                    break;
                }
                Err(status) => {
                    let _ = tx.send(Err(TransportError::Call(status.to_string()))).await;
                    break;
                }
            }
        }
        // Dropping `tx` lets a blocked `receive` observe closure.
    }
}

#[async_trait::async_trait]
impl Transport for GrpcTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.client.lock().is_some() {
            return Err(TransportError::Connection(
                "channel is already open".to_string(),
            ));
        }

        let mut client = ConnectorClient::connect(self.endpoint.clone()).await?;
        let stream = client.fetch_response_data().await?;

        let (tx, rx) = mpsc::channel(self.inbound_capacity);
        tokio::spawn(Self::pump(stream, tx.clone(), self.cancel.clone()));

        *self.client.lock() = Some(client);
        *self.inbound_tx.lock() = Some(tx);
        *self.inbound_rx.lock().await = Some(rx);
        debug!(endpoint = %self.endpoint, "connector channel open");
        Ok(())
    }

    async fn send(&self, payload: EncodedPayload) -> Result<(), TransportError> {
        let mut client = self
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotOpen)?;
        let reply = client.send_command(payload).await?;

        // The unary reply is the result XML; deliver it through the normal
        // inbound path.
        if !reply.is_empty() {
            let tx = self.inbound_tx.lock().clone();
            match tx {
                Some(tx) => {
                    if tx.send(Ok(reply)).await.is_err() {
                        warn!("command result dropped, inbound channel closed");
                    }
                }
                None => warn!("command result dropped, channel not open"),
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<RawPayload>, TransportError> {
        let mut guard = self.inbound_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        match rx.recv().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        *self.client.lock() = None;
        *self.inbound_tx.lock() = None;
        // Cancelling stops the pump, which releases any blocked `receive`;
        // only then can the receiver slot be reclaimed here.
        self.inbound_rx.lock().await.take();
        debug!(endpoint = %self.endpoint, "connector channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn wire_messages_roundtrip_on_tag_one() {
        let request = SendCommandRequest {
            message: "<command id=\"server_status\"/>".to_string(),
        };
        let bytes = request.encode_to_vec();
        // tag 1, wire type 2 (length-delimited)
        assert_eq!(bytes[0], 0x0a);
        let decoded = SendCommandRequest::decode(bytes.as_slice()).expect("decodes");
        assert_eq!(decoded, request);

        let data = DataResponse {
            message: "<markets/>".to_string(),
        };
        let decoded = DataResponse::decode(data.encode_to_vec().as_slice()).expect("decodes");
        assert_eq!(decoded.message, "<markets/>");
    }

    #[test]
    fn data_request_is_empty_on_the_wire() {
        assert!(DataRequest {}.encode_to_vec().is_empty());
    }

    #[tokio::test]
    async fn close_reclaims_the_inbound_channel() {
        let transport = GrpcTransport::new("http://127.0.0.1:1", 16);
        let (tx, rx) = mpsc::channel(16);
        *transport.inbound_tx.lock() = Some(tx);
        *transport.inbound_rx.lock().await = Some(rx);

        transport.close().await.expect("closes");
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn send_and_receive_require_open() {
        let transport = GrpcTransport::new("http://127.0.0.1:1", 16);
        assert!(matches!(
            transport.send("<command id=\"server_status\"/>".to_string()).await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::NotOpen)
        ));
    }
}
