//! Signaling wire protocol
//!
//! One JSON object per WebSocket text frame, tagged by `kind` with the body
//! under `payload`.

mod message;

pub use message::{
    ClientMessage, Counts, IceServer, PartnerInfo, PartnerPayload, Prompt, ServerMessage,
    SignalPayload,
};
