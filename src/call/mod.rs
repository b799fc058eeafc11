//! Call orchestration
//!
//! The state machine that takes a user from "waiting for a stranger" through
//! an active voice call and back out, plus the runtime that executes its
//! effects against injected capability drivers.

mod context;
mod error;
mod event;
mod guard;
mod machine;
mod orchestrator;
mod peer;

use std::time::Duration;

pub use context::CallContext;
pub use error::FatalError;
pub use event::{Command, Effect, Event, Notification, PeerEvent, TimerId};
pub use guard::{CtrlCGuard, HangupGuard, NullGuard};
pub use machine::{
    CallMachine, FlowState, InCallState, LobbyState, MatchingState, MicState, NegotiationState,
    SessionState, WaitState,
};
pub use orchestrator::{CallController, CallOrchestrator, CallSummary, Drivers};
pub use peer::{
    LoopbackPeerDriver, PeerDriver, PeerEventKind, PeerHandle, PeerOptions, PeerSink, RemoteStream,
};

/// How long to wait unmatched before telling the user the wait is unusually
/// long. Purely informational; matching continues.
pub const READY_WAIT: Duration = Duration::from_secs(30);

/// Upper bound on peer negotiation. A negotiation that has not produced a
/// connected call within this window is abandoned and the session reset.
pub const NEGOTIATION_CONNECT: Duration = Duration::from_secs(15);

/// Timing knobs for the call flow, overridable in tests
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ready_wait: Duration,
    pub negotiation_connect: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ready_wait: READY_WAIT,
            negotiation_connect: NEGOTIATION_CONNECT,
        }
    }
}
