//! Call context
//!
//! Mutable state owned exclusively by the orchestrator. Created when the
//! call flow starts, discarded when it tears down; never persisted.

use std::time::Instant;

use crate::audio::MicStream;
use crate::protocol::{IceServer, PartnerInfo, PartnerPayload, Prompt};

use super::peer::RemoteStream;

#[derive(Debug, Default)]
pub struct CallContext {
    /// Opaque session id assigned by the server; cleared to force a fresh
    /// login handshake
    pub session_id: Option<String>,
    /// Informational population counts, last-write-wins from server pushes
    pub online_count: Option<u32>,
    pub talking_count: Option<u32>,
    /// Presence is the sole signal for "currently matched"
    pub partner: Option<PartnerInfo>,
    /// Conversation aids, replaced wholesale on each partner
    pub prompts: Vec<Prompt>,
    /// Relay credentials valid for one negotiation
    pub ice_servers: Vec<IceServer>,
    /// Which side originates the offer, decided by the server per match
    pub should_initiate: bool,
    /// Handle to the capture stream; the supervisor owns the device
    pub mic_stream: Option<MicStream>,
    /// Handle to the remote stream; the negotiation engine owns the media
    pub remote_stream: Option<RemoteStream>,
    /// Set on entering the active call, used for duration reporting
    pub start_time: Option<Instant>,
}

impl CallContext {
    /// Apply a partner push. A null partner clears the match; the associated
    /// per-match data is replaced either way.
    pub(crate) fn store_partner(&mut self, payload: PartnerPayload) {
        self.partner = payload.partner;
        self.should_initiate = payload.should_initiate;
        self.prompts = payload.prompts;
        self.ice_servers = payload.ice_servers;
    }
}
