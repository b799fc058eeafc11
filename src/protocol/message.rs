//! Typed signaling messages
//!
//! Inbound (`ServerMessage`) and outbound (`ClientMessage`) frames share the
//! same envelope: `{"kind": "...", "payload": {...}}`. An inbound frame whose
//! kind is unknown fails to decode; the transport treats that as a protocol
//! violation, not something to retry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The matched remote party, as assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerInfo {
    /// Session id of the partner; negotiation blobs are addressed to it.
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Server-side match record, used to correlate post-call feedback.
    #[serde(rename = "matchID")]
    pub match_id: u64,
    /// Matching metadata (e.g. the partner's region), display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A conversation-aid prompt supplied per match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
}

/// STUN/TURN relay entry, valid for the lifetime of one negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Lobby population counts pushed by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub matched: u32,
    pub answering_questions: u32,
    pub lobby: u32,
}

/// Payload of a `partner` push. A `None` partner means the match ended
/// (remote party left); the remaining fields are absent in that case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartnerPayload {
    #[serde(default)]
    pub partner: Option<PartnerInfo>,
    #[serde(default, rename = "shouldInitiate")]
    pub should_initiate: bool,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default, rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

/// Opaque negotiation blob relayed between matched parties.
///
/// Outbound frames set `to`; the server fills in `from` on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub data: Value,
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum ServerMessage {
    Error {
        message: String,
        #[serde(default)]
        code: Option<u32>,
    },
    Session {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    Ready,
    Info {
        counts: Counts,
    },
    Partner(PartnerPayload),
    Signal(SignalPayload),
}

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum ClientMessage {
    Login {
        token: String,
        /// Resumes an authenticated session after a reconnect; `None` asks
        /// the server for a fresh one.
        #[serde(rename = "sessionID")]
        session_id: Option<String>,
    },
    Match,
    Signal {
        to: String,
        data: Value,
    },
    Heartbeat {},
}
