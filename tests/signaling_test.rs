//! End-to-end tests against an in-process signaling server
//!
//! These run the real WebSocket transport and the development server on a
//! loopback listener, then stack the full orchestrator on top with a fake
//! mic and the loopback negotiation engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley::audio::{CaptureEvent, CaptureSink, MicDriver, MicStream, NullCuePlayer};
use parley::auth::StaticTokenProvider;
use parley::call::{
    CallConfig, CallOrchestrator, Drivers, LoopbackPeerDriver, Notification, NullGuard,
};
use parley::network::{
    DevServerConfig, DevSignalingServer, SignalingConfig, SignalingTransport, Transport,
    TransportEvent, TransportHandle,
};
use parley::protocol::{ClientMessage, ServerMessage};

const WAIT: Duration = Duration::from_secs(10);

async fn start_server() -> String {
    let server = DevSignalingServer::bind("127.0.0.1:0", DevServerConfig::default())
        .await
        .expect("bind dev server");
    let addr = server.local_addr();
    tokio::spawn(server.run());
    format!("ws://{}", addr)
}

fn test_config(url: &str) -> SignalingConfig {
    SignalingConfig {
        url: url.to_string(),
        reconnect_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(100),
    }
}

fn connect(url: &str) -> (Box<dyn TransportHandle>, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = SignalingTransport::new(test_config(url));
    let handle = transport.start(Box::new(move |ev| {
        let _ = tx.send(ev);
    }));
    (handle, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event stream closed")
}

/// Receive frames until one matches, panicking on anything fatal
async fn next_message<F>(rx: &mut mpsc::UnboundedReceiver<TransportEvent>, pred: F) -> ServerMessage
where
    F: Fn(&ServerMessage) -> bool,
{
    loop {
        match next_event(rx).await {
            TransportEvent::Message(msg) if pred(&msg) => return msg,
            TransportEvent::Message(_) => {}
            TransportEvent::Connected | TransportEvent::Disconnected { .. } => {}
            TransportEvent::ProtocolError(e) => panic!("protocol error: {}", e),
        }
    }
}

async fn login(
    handle: &dyn TransportHandle,
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> String {
    loop {
        if let TransportEvent::Connected = next_event(rx).await {
            break;
        }
    }
    handle.send(ClientMessage::Login {
        token: "test-token".to_string(),
        session_id: None,
    });
    let msg = next_message(rx, |m| matches!(m, ServerMessage::Session { .. })).await;
    let ServerMessage::Session { session_id } = msg else {
        unreachable!()
    };
    session_id
}

/// Given a fresh client
/// When it connects and logs in
/// Then the server assigns a session and replays the unmatched snapshot
/// before signaling readiness
#[tokio::test]
async fn test_login_handshake() {
    let url = start_server().await;
    let (handle, mut rx) = connect(&url);

    let session_id = login(handle.as_ref(), &mut rx).await;
    assert!(!session_id.is_empty());

    let msg = next_message(&mut rx, |m| matches!(m, ServerMessage::Partner(_))).await;
    let ServerMessage::Partner(payload) = msg else {
        unreachable!()
    };
    assert!(payload.partner.is_none());

    next_message(&mut rx, |m| matches!(m, ServerMessage::Ready)).await;
    handle.stop();
}

/// Given two logged-in clients requesting a match
/// When the server pairs them
/// Then each learns the other's session id, exactly one side initiates, and
/// both see the same match id
#[tokio::test]
async fn test_matching_pairs_clients() {
    let url = start_server().await;
    let (handle_a, mut rx_a) = connect(&url);
    let (handle_b, mut rx_b) = connect(&url);

    let sid_a = login(handle_a.as_ref(), &mut rx_a).await;
    let sid_b = login(handle_b.as_ref(), &mut rx_b).await;

    next_message(&mut rx_a, |m| matches!(m, ServerMessage::Ready)).await;
    next_message(&mut rx_b, |m| matches!(m, ServerMessage::Ready)).await;

    handle_a.send(ClientMessage::Match);
    handle_b.send(ClientMessage::Match);

    let partner_of = |m: &ServerMessage| {
        matches!(m, ServerMessage::Partner(p) if p.partner.is_some())
    };
    let ServerMessage::Partner(pa) = next_message(&mut rx_a, partner_of).await else {
        unreachable!()
    };
    let ServerMessage::Partner(pb) = next_message(&mut rx_b, partner_of).await else {
        unreachable!()
    };

    let partner_a = pa.partner.expect("partner for a");
    let partner_b = pb.partner.expect("partner for b");
    assert_eq!(partner_a.session_id, sid_b);
    assert_eq!(partner_b.session_id, sid_a);
    assert_eq!(partner_a.match_id, partner_b.match_id);
    assert_ne!(pa.should_initiate, pb.should_initiate);
    assert!(!pa.ice_servers.is_empty());
    assert!(!pa.prompts.is_empty());

    handle_a.stop();
    handle_b.stop();
}

/// Given a matched pair
/// When one sends a negotiation blob addressed to the other
/// Then the server relays it with the sender's id filled in
#[tokio::test]
async fn test_signal_relay_fills_sender() {
    let url = start_server().await;
    let (handle_a, mut rx_a) = connect(&url);
    let (handle_b, mut rx_b) = connect(&url);

    let sid_a = login(handle_a.as_ref(), &mut rx_a).await;
    let sid_b = login(handle_b.as_ref(), &mut rx_b).await;

    handle_a.send(ClientMessage::Match);
    handle_b.send(ClientMessage::Match);
    next_message(&mut rx_a, |m| {
        matches!(m, ServerMessage::Partner(p) if p.partner.is_some())
    })
    .await;

    handle_a.send(ClientMessage::Signal {
        to: sid_b,
        data: json!({"type": "offer", "sdp": "v=0"}),
    });

    let msg = next_message(&mut rx_b, |m| matches!(m, ServerMessage::Signal(_))).await;
    let ServerMessage::Signal(payload) = msg else {
        unreachable!()
    };
    assert_eq!(payload.from.as_deref(), Some(sid_a.as_str()));
    assert_eq!(payload.data["type"], "offer");

    handle_a.stop();
    handle_b.stop();
}

/// Given a matched pair
/// When one side's connection goes away
/// Then the remaining side is told the match ended via a null partner
#[tokio::test]
async fn test_departure_notifies_remnant() {
    let url = start_server().await;
    let (handle_a, mut rx_a) = connect(&url);
    let (handle_b, mut rx_b) = connect(&url);

    login(handle_a.as_ref(), &mut rx_a).await;
    login(handle_b.as_ref(), &mut rx_b).await;

    handle_a.send(ClientMessage::Match);
    handle_b.send(ClientMessage::Match);
    next_message(&mut rx_b, |m| {
        matches!(m, ServerMessage::Partner(p) if p.partner.is_some())
    })
    .await;

    handle_a.stop();

    let msg = next_message(&mut rx_b, |m| {
        matches!(m, ServerMessage::Partner(p) if p.partner.is_none())
    })
    .await;
    assert!(matches!(msg, ServerMessage::Partner(_)));
    handle_b.stop();
}

/// Mic driver that always produces a detached stream
struct FakeMic;

impl MicDriver for FakeMic {
    fn acquire(&self, sink: CaptureSink) {
        sink(CaptureEvent::Acquired(MicStream::detached("fake", 48000, 1)));
    }
}

fn drivers(url: &str) -> Drivers {
    Drivers {
        transport: Arc::new(SignalingTransport::new(test_config(url))),
        tokens: Arc::new(StaticTokenProvider::new("test-token")),
        mic: Arc::new(FakeMic),
        peer: Arc::new(LoopbackPeerDriver),
        cues: Arc::new(NullCuePlayer),
        guard: Arc::new(NullGuard),
    }
}

async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Notification>, pred: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    timeout(WAIT, async {
        loop {
            let note = rx.recv().await.expect("notification stream closed");
            if pred(&note) {
                return note;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Given two full orchestrators against a real server
/// When both start matching
/// Then they negotiate through the relay, both report the call established
/// with the same match id, and a hangup on one side ends the call for both
#[tokio::test]
async fn test_two_orchestrators_complete_a_call() {
    let url = start_server().await;

    let (orch_a, ctl_a, mut notes_a) = CallOrchestrator::new(CallConfig::default(), drivers(&url));
    let (orch_b, ctl_b, mut notes_b) = CallOrchestrator::new(CallConfig::default(), drivers(&url));
    let flow_a = tokio::spawn(orch_a.run());
    let flow_b = tokio::spawn(orch_b.run());

    wait_for(&mut notes_a, |n| matches!(n, Notification::ReadyToMatch)).await;
    wait_for(&mut notes_b, |n| matches!(n, Notification::ReadyToMatch)).await;

    ctl_a.start_matching();
    ctl_b.start_matching();

    let established_a = wait_for(&mut notes_a, |n| {
        matches!(n, Notification::CallEstablished { .. })
    })
    .await;
    let established_b = wait_for(&mut notes_b, |n| {
        matches!(n, Notification::CallEstablished { .. })
    })
    .await;
    assert_eq!(established_a, established_b);

    ctl_a.hang_up();

    wait_for(&mut notes_a, |n| matches!(n, Notification::CallEnded { .. })).await;
    let summary_a = timeout(WAIT, flow_a)
        .await
        .expect("flow a timed out")
        .expect("flow a panicked")
        .expect("flow a failed");

    // A's departure reaches B as a null partner push
    wait_for(&mut notes_b, |n| matches!(n, Notification::CallEnded { .. })).await;
    let summary_b = timeout(WAIT, flow_b)
        .await
        .expect("flow b timed out")
        .expect("flow b panicked")
        .expect("flow b failed");

    assert!(summary_a.duration <= Duration::from_secs(10));
    assert!(summary_b.duration <= Duration::from_secs(10));
}
