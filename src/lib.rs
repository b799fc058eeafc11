//! Voice-call orchestration for a stranger-matching service.
//!
//! The crate connects a persistent signaling channel, a microphone
//! supervisor, and a peer negotiation engine under one state machine that
//! takes a user from the waiting room through an active voice call and back
//! out. Media and matching live behind injectable driver traits; the
//! orchestration logic itself is pure and fully testable.
//!
//! - [`call`]: the orchestrator state machine and runtime
//! - [`network`]: the reconnecting signaling transport and a dev server
//! - [`protocol`]: the JSON wire protocol
//! - [`audio`]: capture acquisition and call cues
//! - [`auth`]: the identity-provider boundary

pub mod audio;
pub mod auth;
pub mod call;
pub mod network;
pub mod protocol;

pub use call::{CallConfig, CallController, CallOrchestrator, CallSummary, Drivers, Notification};
pub use network::{SignalingConfig, SignalingTransport};
