//! Event and effect vocabulary
//!
//! Every input to the orchestrator arrives as an [`Event`] on one queue, and
//! every transition returns its side effects as [`Effect`] data. The runtime
//! executes effects after the transition, keeping the state machine itself
//! free of I/O.

use std::time::Duration;

use serde_json::Value;

use crate::audio::{CaptureEvent, Cue};
use crate::network::TransportEvent;
use crate::protocol::ClientMessage;

use super::error::FatalError;
use super::peer::{PeerEventKind, PeerOptions};

/// User/embedder commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Request to start matching (the explicit user gesture)
    StartMatching,
    /// End the current call cleanly
    HangUp,
    /// User interaction; drives the presence heartbeat
    Activity,
}

/// Timers scoped to the state that started them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Pre-match patience window
    ReadyWait,
    /// Bound on peer negotiation establishment
    NegotiationConnect,
}

/// Event from a negotiation engine, stamped with the generation that
/// produced it so stale completions never mutate current state
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// One input to the orchestrator state machine
#[derive(Debug)]
pub enum Event {
    Command(Command),
    Ws(TransportEvent),
    /// Token fetch completion
    Token(Result<String, String>),
    /// Capture event, stamped with the acquisition epoch
    Mic { epoch: u64, event: CaptureEvent },
    Peer(PeerEvent),
    Timer(TimerId),
}

/// Outward-facing notifications for the embedding flow/UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The pre-match patience window elapsed; the UI may offer opt-in
    /// notifications instead of blind waiting
    WaitTimedOut,
    /// The server is ready to accept a match request
    ReadyToMatch,
    /// Media is flowing; used for post-call feedback correlation
    CallEstablished { match_id: u64 },
    /// The call ended; duration measured from call establishment start
    CallEnded { duration: Duration },
}

/// A side effect requested by a transition, executed by the runtime
#[derive(Debug)]
pub enum Effect {
    /// (Re)start the signaling transport; stops any running instance first
    StartTransport,
    /// Send a message over the signaling channel
    SendWs(ClientMessage),
    /// Ask the identity provider for a bearer token
    FetchToken,
    /// Request the capture device
    AcquireMic { epoch: u64 },
    /// Start a negotiation engine; the previous engine's teardown must have
    /// completed first (the runtime executes `StopPeer` synchronously)
    StartPeer { generation: u64, options: PeerOptions },
    /// Tear down the live negotiation engine
    StopPeer,
    /// Forward an inbound remote-description blob to the live engine
    SignalPeer(Value),
    StartTimer(TimerId, Duration),
    CancelTimer(TimerId),
    /// Warm up the audio output path from the user gesture
    PrimeAudio,
    PlayCue(Cue),
    EngageGuard,
    DisengageGuard,
    Notify(Notification),
    /// Escalate out of the entire call flow
    Fatal(FatalError),
}
