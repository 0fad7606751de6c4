//! Session lifecycle integration tests.
//!
//! Drive a [`Session`] over the in-memory channel adapter, with the test
//! playing the connector side: acknowledging connects, answering commands,
//! and injecting faults.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use transaq_client::transport::channel::{self, ChannelRemote};
use transaq_client::{
    ClientSettings, Command, ConnectParams, DecodeError, MessageHandler, RawPayload, Security,
    Session, SessionError, SessionState, TransaqMessage, TransportError,
};

const CONNECT_ACK: &str = r#"<server_status connected="true" server_tz="Europe/Moscow"/>"#;

#[derive(Debug)]
enum Event {
    Message(TransaqMessage),
    DecodeError(String),
    SessionLost(String),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl MessageHandler for Recorder {
    fn on_message(&self, message: TransaqMessage) {
        let _ = self.events.send(Event::Message(message));
    }

    fn on_decode_error(&self, error: &DecodeError, _raw: &RawPayload) {
        let _ = self.events.send(Event::DecodeError(error.to_string()));
    }

    fn on_session_lost(&self, error: &TransportError) {
        let _ = self.events.send(Event::SessionLost(error.to_string()));
    }
}

struct Harness {
    session: Session,
    remote: Arc<ChannelRemote>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn harness_with(settings: ClientSettings) -> Harness {
    let (transport, remote) = channel::pair();
    let (tx, events) = mpsc::unbounded_channel();
    let session = Session::new(
        Arc::new(transport),
        Arc::new(Recorder { events: tx }),
        settings,
    );
    Harness {
        session,
        remote: Arc::new(remote),
        events,
    }
}

fn harness() -> Harness {
    harness_with(ClientSettings::default())
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

/// Answer the pending connect command with a positive acknowledgement.
fn ack_next_connect(remote: &Arc<ChannelRemote>) {
    let remote = Arc::clone(remote);
    tokio::spawn(async move {
        let sent = remote.next_sent().await.expect("connect command sent");
        assert!(sent.starts_with("<command id=\"connect\">"));
        remote.push(CONNECT_ACK);
    });
}

async fn connect(harness: &mut Harness) {
    ack_next_connect(&harness.remote);
    harness
        .session
        .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
        .await
        .expect("connect succeeds");
    assert_eq!(harness.session.state(), SessionState::Connected);
    // The acknowledgement is also delivered as a normal message.
    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::Message(TransaqMessage::ConnectAck(_))
    ));
}

fn gazp() -> Security {
    Security::new("TQBR", "GAZP").expect("valid security")
}

fn creds() -> ConnectParams {
    ConnectParams::new("TCNN1234", "secret").expect("valid params")
}

// =============================================================================
// End-to-end command round trip
// =============================================================================

#[tokio::test]
async fn security_info_round_trip_and_terminal_disconnect() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness
        .session
        .send_command(Command::GetSecurityInfo { security: gazp() })
        .await
        .expect("send succeeds");

    let sent = harness.remote.next_sent().await.expect("command sent");
    assert!(sent.starts_with("<command id=\"get_securities_info\">"));
    assert!(sent.contains("<seccode>GAZP</seccode>"));

    harness.remote.push(
        "<sec_info secid=\"42\"><board>TQBR</board><seccode>GAZP</seccode>\
         <secname>Gazprom</secname></sec_info>",
    );

    match next_event(&mut harness.events).await {
        Event::Message(TransaqMessage::SecurityInfo(info)) => {
            assert_eq!(info.board, "TQBR");
            assert_eq!(info.seccode, "GAZP");
        }
        other => panic!("expected SecurityInfo, got {other:?}"),
    }

    harness.session.disconnect().await.expect("disconnects");
    assert_eq!(harness.session.state(), SessionState::Disconnected);

    // Terminal: no further commands, no reconnect on the same instance.
    assert!(matches!(
        harness
            .session
            .send_command(Command::ServerStatus)
            .await,
        Err(SessionError::InvalidState { .. })
    ));
    assert!(matches!(
        harness
            .session
            .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
            .await,
        Err(SessionError::InvalidState { .. })
    ));
}

// =============================================================================
// State machine enforcement
// =============================================================================

#[tokio::test]
async fn send_while_disconnected_performs_no_transport_io() {
    let harness = harness();
    let result = harness.session.send_command(Command::ServerStatus).await;
    assert!(matches!(
        result,
        Err(SessionError::InvalidState {
            operation: "send_command",
            state: SessionState::Disconnected,
        })
    ));
    assert_eq!(harness.remote.send_count(), 0);
}

#[tokio::test]
async fn connect_while_connecting_is_rejected() {
    let (transport, remote) = channel::pair();
    let (tx, _events) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        Arc::new(transport),
        Arc::new(Recorder { events: tx }),
        ClientSettings::default(),
    ));
    let remote = Arc::new(remote);

    // Hold the acknowledgement back long enough to observe Connecting.
    {
        let remote = Arc::clone(&remote);
        tokio::spawn(async move {
            let _ = remote.next_sent().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            remote.push(CONNECT_ACK);
        });
    }
    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.connect(creds()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Connecting);

    assert!(matches!(
        session.connect(creds()).await,
        Err(SessionError::InvalidState {
            operation: "connect",
            state: SessionState::Connecting,
        })
    ));

    first
        .await
        .expect("task completes")
        .expect("first connect still succeeds");
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    let mut harness = harness();
    connect(&mut harness).await;
    assert!(matches!(
        harness
            .session
            .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
            .await,
        Err(SessionError::InvalidState {
            operation: "connect",
            state: SessionState::Connected,
        })
    ));
}

#[tokio::test]
async fn encoder_rejection_performs_no_transport_io() {
    let mut harness = harness();
    connect(&mut harness).await;
    let sends_before = harness.remote.send_count();

    assert!(Command::cancel_order(0).is_err());
    assert!(Command::subscribe_quotes(Vec::new()).is_err());
    assert_eq!(harness.remote.send_count(), sends_before);
}

// =============================================================================
// Connect failure paths
// =============================================================================

#[tokio::test]
async fn connect_times_out_without_acknowledgement() {
    let mut harness = harness_with(ClientSettings {
        connect_timeout: Duration::from_millis(100),
        ..ClientSettings::default()
    });

    // Consume the connect command but never acknowledge.
    let remote = Arc::clone(&harness.remote);
    tokio::spawn(async move {
        let _ = remote.next_sent().await;
    });

    let result = harness
        .session
        .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
        .await;
    assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
    assert_eq!(harness.session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn connect_surfaces_connector_login_error() {
    let mut harness = harness();
    let remote = Arc::clone(&harness.remote);
    tokio::spawn(async move {
        let _ = remote.next_sent().await;
        remote.push(r#"<server_status connected="error">wrong password</server_status>"#);
    });

    let result = harness
        .session
        .connect(ConnectParams::new("TCNN1234", "bad").expect("valid params"))
        .await;
    match result {
        Err(SessionError::ConnectFailed(reason)) => {
            assert!(reason.contains("wrong password"));
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert_eq!(harness.session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn refused_channel_leaves_session_reusable() {
    let harness = harness();
    harness.remote.refuse_open();
    let result = harness
        .session
        .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
        .await;
    assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
    assert_eq!(harness.session.state(), SessionState::Disconnected);
}

// =============================================================================
// Dispatch semantics
// =============================================================================

#[tokio::test]
async fn delivery_preserves_arrival_order() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness.remote.push("<markets><market id=\"1\">MICEX</market></markets>");
    harness.remote.push("<error>maintenance window</error>");
    harness.remote.push(r#"<client id="C1"/>"#);

    let kinds: Vec<&str> = [
        next_event(&mut harness.events).await,
        next_event(&mut harness.events).await,
        next_event(&mut harness.events).await,
    ]
    .iter()
    .map(|event| match event {
        Event::Message(message) => message.kind(),
        other => panic!("expected message, got {other:?}"),
    })
    .collect();
    assert_eq!(kinds, ["markets", "error", "client"]);
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_stream_continues() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness.remote.push("definitely not xml");
    harness.remote.push("<unknown_root/>");
    harness.remote.push("<markets><market id=\"1\">MICEX</market></markets>");

    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::DecodeError(_)
    ));
    match next_event(&mut harness.events).await {
        Event::DecodeError(text) => assert!(text.contains("unknown_root")),
        other => panic!("expected decode error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::Message(TransaqMessage::Markets(_))
    ));
    assert_eq!(harness.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn transport_failure_reports_loss_exactly_once() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness.remote.fail(TransportError::Closed);

    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::SessionLost(_)
    ));
    // Give a hypothetical duplicate a chance to appear.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.events.try_recv().is_err());
    assert_eq!(harness.session.state(), SessionState::Disconnected);

    // The session is terminal after loss.
    assert!(matches!(
        harness
            .session
            .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
            .await,
        Err(SessionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn orderly_stream_close_outside_disconnect_is_loss() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness.remote.close_stream();

    match next_event(&mut harness.events).await {
        Event::SessionLost(reason) => assert!(reason.contains("closed")),
        other => panic!("expected session loss, got {other:?}"),
    }
    assert_eq!(harness.session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn loss_right_after_acknowledgement_is_still_loss() {
    let mut harness = harness();
    // Acknowledge the connect and kill the link back to back, so the loop
    // observes the failure while `connect` may still be waking up.
    {
        let remote = Arc::clone(&harness.remote);
        tokio::spawn(async move {
            let sent = remote.next_sent().await.expect("connect command sent");
            assert!(sent.starts_with("<command id=\"connect\">"));
            remote.push(CONNECT_ACK);
            remote.fail(TransportError::Closed);
        });
    }
    let connected = harness.session.connect(creds()).await;

    // Whichever side won the race, the acknowledgement was dispatched and
    // the loss must be reported exactly once.
    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::Message(TransaqMessage::ConnectAck(_))
    ));
    assert!(matches!(
        next_event(&mut harness.events).await,
        Event::SessionLost(_)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.events.try_recv().is_err());

    // Never a live state over a dead link.
    assert_eq!(harness.session.state(), SessionState::Disconnected);
    if let Err(error) = connected {
        assert!(matches!(error, SessionError::ConnectFailed(_)));
    }
    assert!(matches!(
        harness.session.send_command(Command::ServerStatus).await,
        Err(SessionError::InvalidState { .. })
    ));
}

// =============================================================================
// Disconnect behavior
// =============================================================================

#[tokio::test]
async fn disconnect_during_connecting_resolves_connect_promptly() {
    let (transport, remote) = channel::pair();
    let (tx, _events) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        Arc::new(transport),
        Arc::new(Recorder { events: tx }),
        ClientSettings::default(),
    ));
    let remote = Arc::new(remote);

    // Consume the connect command, never acknowledge.
    {
        let remote = Arc::clone(&remote);
        tokio::spawn(async move {
            let _ = remote.next_sent().await;
        });
    }
    let connecting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.connect(creds()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Connecting);

    session.disconnect().await.expect("disconnects");

    // The parked connect must fail now, not after the full connect timeout.
    let result = tokio::time::timeout(Duration::from_secs(1), connecting)
        .await
        .expect("connect resolves promptly")
        .expect("task completes");
    assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_prompt() {
    let mut harness = harness();
    connect(&mut harness).await;

    // The receive loop is blocked on an empty stream; disconnect must not
    // hang behind it.
    let done = tokio::time::timeout(Duration::from_secs(1), harness.session.disconnect()).await;
    assert!(done.expect("prompt").is_ok());
    assert_eq!(harness.session.state(), SessionState::Disconnected);

    harness.session.disconnect().await.expect("second disconnect is a no-op");

    // No loss report for a requested teardown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = harness.events.try_recv() {
        assert!(
            !matches!(event, Event::SessionLost(_)),
            "requested disconnect must not be reported as loss"
        );
    }
}

#[tokio::test]
async fn disconnect_sends_farewell_command_best_effort() {
    let mut harness = harness();
    connect(&mut harness).await;

    harness.session.disconnect().await.expect("disconnects");
    let sent = harness.remote.next_sent().await.expect("farewell sent");
    assert_eq!(sent, "<command id=\"disconnect\"/>");
}

// =============================================================================
// Handler containment
// =============================================================================

struct PanickyHandler {
    forwarded: mpsc::UnboundedSender<TransaqMessage>,
}

impl MessageHandler for PanickyHandler {
    fn on_message(&self, message: TransaqMessage) {
        if matches!(message, TransaqMessage::ServerError(_)) {
            panic!("handler bug");
        }
        let _ = self.forwarded.send(message);
    }
}

#[tokio::test]
async fn handler_panic_does_not_stop_dispatch() {
    let (transport, remote) = channel::pair();
    let (tx, mut forwarded) = mpsc::unbounded_channel();
    let session = Session::new(
        Arc::new(transport),
        Arc::new(PanickyHandler { forwarded: tx }),
        ClientSettings::default(),
    );
    let remote = Arc::new(remote);

    ack_next_connect(&remote);
    session
        .connect(ConnectParams::new("TCNN1234", "secret").expect("valid params"))
        .await
        .expect("connect succeeds");
    // Drain the forwarded connect acknowledgement.
    let _ = tokio::time::timeout(Duration::from_secs(2), forwarded.recv())
        .await
        .expect("ack forwarded");

    remote.push("<error>boom</error>"); // handler panics on this one
    remote.push("<markets><market id=\"1\">MICEX</market></markets>");

    let survived = tokio::time::timeout(Duration::from_secs(2), forwarded.recv())
        .await
        .expect("dispatch continues")
        .expect("message delivered");
    assert!(matches!(survived, TransaqMessage::Markets(_)));
    assert_eq!(session.state(), SessionState::Connected);
}
