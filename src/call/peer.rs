//! Peer negotiation engine boundary
//!
//! One engine instance exists per match. It turns the local capture stream
//! plus inbound remote-description blobs into a bidirectional audio session,
//! emitting lifecycle events along the way. The engine never touches the
//! network: every blob it produces is relayed by the orchestrator over the
//! signaling channel, addressed to the partner's session id, so reconnect
//! logic is not duplicated here.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::audio::MicStream;
use crate::protocol::IceServer;

/// Handle to the remote party's media stream
#[derive(Debug, Clone)]
pub struct RemoteStream {
    /// Driver-specific stream identifier
    pub id: String,
}

/// Everything an engine needs, fixed for the lifetime of one negotiation
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Whether this side originates the offer (decided by the server)
    pub initiator: bool,
    /// Local capture stream; `None` runs the call receive-only
    pub local_stream: Option<MicStream>,
    /// Relay/STUN credentials supplied for this match only
    pub relay_config: Vec<IceServer>,
}

/// Lifecycle events emitted by a negotiation engine
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Local description blob to relay to the remote party
    Signal(Value),
    /// Media is flowing both directions
    Connected,
    /// The remote party's stream became available
    RemoteStream(RemoteStream),
    /// Clean end of the session
    Closed,
    /// Abnormal end of the session
    Error(String),
}

/// Callback receiving engine lifecycle events
pub type PeerSink = Box<dyn Fn(PeerEventKind) + Send + Sync + 'static>;

/// Negotiation engine factory, injectable so the media stack stays pluggable
pub trait PeerDriver: Send + Sync {
    fn start(&self, options: PeerOptions, sink: PeerSink) -> Box<dyn PeerHandle>;
}

/// A live negotiation engine
pub trait PeerHandle: Send {
    /// Feed an inbound remote-description blob into the engine
    fn signal(&self, data: Value);
    /// Tear down the engine, releasing all negotiation and media resources.
    /// Idempotent; must run regardless of which lifecycle event triggered it.
    fn destroy(&mut self);
}

/// Simulated negotiation for demos and tests
///
/// Performs a one-round offer/answer exchange through whatever relays its
/// blobs (in production wiring, the real signaling channel) and then reports
/// the session connected. No media flows; the remote stream is a label.
pub struct LoopbackPeerDriver;

impl PeerDriver for LoopbackPeerDriver {
    fn start(&self, options: PeerOptions, sink: PeerSink) -> Box<dyn PeerHandle> {
        let handle = LoopbackPeer {
            state: Arc::new(Mutex::new(LoopbackState {
                initiator: options.initiator,
                connected: false,
                destroyed: false,
            })),
            sink: Arc::new(sink),
        };
        if options.initiator {
            (handle.sink)(PeerEventKind::Signal(json!({ "type": "offer" })));
        }
        debug!(
            "Loopback peer started (initiator: {}, mic: {})",
            options.initiator,
            options.local_stream.is_some()
        );
        Box::new(handle)
    }
}

struct LoopbackState {
    initiator: bool,
    connected: bool,
    destroyed: bool,
}

struct LoopbackPeer {
    state: Arc<Mutex<LoopbackState>>,
    sink: Arc<PeerSink>,
}

impl PeerHandle for LoopbackPeer {
    fn signal(&self, data: Value) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "offer" if !state.initiator && !state.connected => {
                state.connected = true;
                drop(state);
                (self.sink)(PeerEventKind::Signal(json!({ "type": "answer" })));
                (self.sink)(PeerEventKind::Connected);
                (self.sink)(PeerEventKind::RemoteStream(RemoteStream {
                    id: "loopback".to_string(),
                }));
            }
            "answer" if state.initiator && !state.connected => {
                state.connected = true;
                drop(state);
                (self.sink)(PeerEventKind::Connected);
                (self.sink)(PeerEventKind::RemoteStream(RemoteStream {
                    id: "loopback".to_string(),
                }));
            }
            other => {
                warn!("Loopback peer ignoring blob of type {:?}", other);
            }
        }
    }

    fn destroy(&mut self) {
        let mut state = self.state.lock();
        if !state.destroyed {
            state.destroyed = true;
            debug!("Loopback peer destroyed");
        }
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collecting_sink() -> (PeerSink, mpsc::Receiver<PeerEventKind>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(move |ev| tx.send(ev).unwrap()), rx)
    }

    fn options(initiator: bool) -> PeerOptions {
        PeerOptions {
            initiator,
            local_stream: None,
            relay_config: Vec::new(),
        }
    }

    #[test]
    fn test_initiator_emits_offer() {
        let (sink, rx) = collecting_sink();
        let _peer = LoopbackPeerDriver.start(options(true), sink);
        assert!(matches!(rx.try_recv(), Ok(PeerEventKind::Signal(_))));
    }

    #[test]
    fn test_responder_answers_offer_and_connects() {
        let (sink, rx) = collecting_sink();
        let peer = LoopbackPeerDriver.start(options(false), sink);
        assert!(rx.try_recv().is_err());

        peer.signal(json!({ "type": "offer" }));
        assert!(matches!(rx.try_recv(), Ok(PeerEventKind::Signal(_))));
        assert!(matches!(rx.try_recv(), Ok(PeerEventKind::Connected)));
        assert!(matches!(rx.try_recv(), Ok(PeerEventKind::RemoteStream(_))));
    }

    #[test]
    fn test_destroyed_peer_ignores_signals() {
        let (sink, rx) = collecting_sink();
        let mut peer = LoopbackPeerDriver.start(options(false), sink);
        peer.destroy();
        peer.signal(json!({ "type": "offer" }));
        assert!(rx.try_recv().is_err());
    }
}
