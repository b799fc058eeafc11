//! Call orchestration state machine
//!
//! Three concurrent regions — session (transport + authentication handshake),
//! flow (waiting room through teardown), mic (capture supervision) — share
//! one [`CallContext`] and consume one event queue. Transitions mutate state
//! and return their side effects as data; no I/O happens here.
//!
//! ```text
//! session: disconnected -> loggingIn -> awaitingPartner -> active
//!                ^--------------------- (transport drop) ------'
//!
//! flow: preMatch -> micSetup -> matching -> inCall -> ended
//!                                  ^           |
//!                                  '-(timeout)-'
//! ```
//!
//! After each event the machine settles: condition-driven transitions (for
//! example "partner assigned, leave pre-match") are applied repeatedly until
//! nothing changes, so any interleaving of events from independent sources
//! reaches the same place.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::audio::{CaptureEvent, Cue};
use crate::network::TransportEvent;
use crate::protocol::{ClientMessage, ServerMessage};

use super::context::CallContext;
use super::error::FatalError;
use super::event::{Command, Effect, Event, Notification, TimerId};
use super::peer::{PeerEventKind, PeerOptions};
use super::CallConfig;

/// Transport connectivity and authentication handshake with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connected; fetching a token to log in with
    LoggingIn,
    /// Logged in; waiting for the server's view of our match state
    AwaitingPartner,
    Active,
}

/// Capture device supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    None,
    Active,
}

/// Pre-match patience timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Waiting,
    TimedOut,
}

/// Pre-match server readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    /// Waiting for the session to become active
    Connecting,
    /// Session active; waiting for the server's ready signal
    Lobby,
    /// The user may request matching
    ReadyToMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    /// Session must be confirmed active before (re)requesting a match
    AwaitingConnection,
    /// Match request sent; waiting for a partner
    AwaitingMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InCallState {
    /// A negotiation engine is running
    Active(NegotiationState),
    /// The engine died; a fresh one starts once the session is active again
    Disconnected,
}

/// Top-level call flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    PreMatch { wait: WaitState, lobby: LobbyState },
    MicSetup,
    Matching(MatchingState),
    InCall(InCallState),
    Ended,
}

/// The orchestrator state machine
pub struct CallMachine {
    config: CallConfig,
    ctx: CallContext,
    session: SessionState,
    flow: FlowState,
    mic: MicState,
    /// Stamp for capture acquisitions; stale completions are ignored
    mic_epoch: u64,
    /// Stamp for negotiation engines; stale events are ignored
    peer_generation: u64,
    /// True between a StartPeer effect and the matching StopPeer
    engine_alive: bool,
    ended_duration: Option<Duration>,
    now: Instant,
}

impl CallMachine {
    /// Create the machine and return its entry effects
    pub fn new(config: CallConfig, now: Instant) -> (Self, Vec<Effect>) {
        let machine = Self {
            ctx: CallContext::default(),
            session: SessionState::Disconnected,
            flow: FlowState::PreMatch {
                wait: WaitState::Waiting,
                lobby: LobbyState::Connecting,
            },
            mic: MicState::None,
            mic_epoch: 0,
            peer_generation: 0,
            engine_alive: false,
            ended_duration: None,
            now,
            config,
        };
        info!("Call flow started");
        let effects = vec![
            Effect::StartTransport,
            Effect::StartTimer(TimerId::ReadyWait, machine.config.ready_wait),
        ];
        (machine, effects)
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    pub fn flow(&self) -> FlowState {
        self.flow
    }

    pub fn mic(&self) -> MicState {
        self.mic
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.flow, FlowState::Ended)
    }

    /// Call duration, available once the flow has ended
    pub fn ended_duration(&self) -> Option<Duration> {
        self.ended_duration
    }

    /// Process one event and return the side effects to execute
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        self.now = now;
        let mut effects = Vec::new();

        // Fatal escalations and stateless stores apply in every state
        match &event {
            Event::Ws(TransportEvent::Message(ServerMessage::Error { message, code })) => {
                error!("Server pushed an error: {}", message);
                effects.push(Effect::Fatal(FatalError::Server {
                    message: message.clone(),
                    code: *code,
                }));
                return effects;
            }
            Event::Ws(TransportEvent::ProtocolError(e)) => {
                effects.push(Effect::Fatal(FatalError::Protocol(e.clone())));
                return effects;
            }
            Event::Ws(TransportEvent::Message(ServerMessage::Session { session_id })) => {
                self.ctx.session_id = Some(session_id.clone());
            }
            Event::Ws(TransportEvent::Message(ServerMessage::Info { counts })) => {
                self.ctx.talking_count = Some(counts.matched);
                self.ctx.online_count =
                    Some(counts.matched + counts.answering_questions + counts.lobby);
            }
            _ => {}
        }

        self.handle_session(&event, &mut effects);
        self.handle_mic(&event);
        self.handle_flow(&event, &mut effects);
        self.settle(&mut effects);
        effects
    }

    fn handle_session(&mut self, event: &Event, effects: &mut Vec<Effect>) {
        match (self.session, event) {
            // Every fresh connection requires a fresh login handshake
            (_, Event::Ws(TransportEvent::Connected)) => {
                debug!("Transport connected; logging in");
                self.session = SessionState::LoggingIn;
                effects.push(Effect::FetchToken);
            }
            (state, Event::Ws(TransportEvent::Disconnected { code }))
                if state != SessionState::Disconnected =>
            {
                debug!("Transport dropped (code {:?})", code);
                self.session = SessionState::Disconnected;
            }
            (SessionState::LoggingIn, Event::Token(Ok(token))) => {
                effects.push(Effect::SendWs(ClientMessage::Login {
                    token: token.clone(),
                    session_id: self.ctx.session_id.clone(),
                }));
                self.session = SessionState::AwaitingPartner;
            }
            (SessionState::LoggingIn, Event::Token(Err(e))) => {
                effects.push(Effect::Fatal(FatalError::TokenFetch(e.clone())));
            }
            (
                SessionState::AwaitingPartner,
                Event::Ws(TransportEvent::Message(ServerMessage::Partner(payload))),
            ) => {
                self.ctx.store_partner(payload.clone());
                self.session = SessionState::Active;
            }
            (
                SessionState::Active,
                Event::Ws(TransportEvent::Message(ServerMessage::Partner(payload))),
            ) => {
                self.ctx.store_partner(payload.clone());
            }
            _ => {}
        }
    }

    fn handle_mic(&mut self, event: &Event) {
        let Event::Mic { epoch, event: capture } = event else {
            return;
        };
        if *epoch != self.mic_epoch {
            debug!("Ignoring stale capture event");
            return;
        }
        match (self.mic, capture) {
            (MicState::Active, CaptureEvent::Acquired(stream)) => {
                debug!("Capture stream acquired: {}", stream.device_name());
                self.ctx.mic_stream = Some(stream.clone());
            }
            (MicState::Active, CaptureEvent::Rejected(err)) => {
                warn!("Capture rejected: {} (continuing without a mic)", err);
                self.mic = MicState::None;
                self.ctx.mic_stream = None;
            }
            (MicState::Active, CaptureEvent::Lost) => {
                warn!("Capture device lost");
                self.mic = MicState::None;
                self.ctx.mic_stream = None;
            }
            _ => {}
        }
    }

    fn handle_flow(&mut self, event: &Event, effects: &mut Vec<Effect>) {
        match (self.flow, event) {
            (
                FlowState::PreMatch {
                    wait: WaitState::Waiting,
                    lobby,
                },
                Event::Timer(TimerId::ReadyWait),
            ) => {
                info!("Still unmatched after the patience window");
                self.flow = FlowState::PreMatch {
                    wait: WaitState::TimedOut,
                    lobby,
                };
                effects.push(Effect::Notify(Notification::WaitTimedOut));
            }
            (
                FlowState::PreMatch {
                    wait,
                    lobby: LobbyState::Lobby,
                },
                Event::Ws(TransportEvent::Message(ServerMessage::Ready)),
            ) => {
                info!("Server ready; matching may be requested");
                self.flow = FlowState::PreMatch {
                    wait,
                    lobby: LobbyState::ReadyToMatch,
                };
                effects.push(Effect::Notify(Notification::ReadyToMatch));
            }
            (
                FlowState::PreMatch {
                    lobby: LobbyState::ReadyToMatch,
                    ..
                },
                Event::Command(Command::StartMatching),
            ) => {
                self.enter_flow(FlowState::MicSetup, effects);
            }
            // Denial is degraded, not blocking: continue without a mic
            (
                FlowState::MicSetup,
                Event::Mic {
                    epoch,
                    event: CaptureEvent::Rejected(_),
                },
            ) if *epoch == self.mic_epoch => {
                self.enter_flow(
                    FlowState::Matching(MatchingState::AwaitingConnection),
                    effects,
                );
            }
            (
                FlowState::Matching(_),
                Event::Mic {
                    epoch,
                    event: CaptureEvent::Lost,
                },
            ) if *epoch == self.mic_epoch => {
                self.enter_flow(FlowState::MicSetup, effects);
            }
            (
                FlowState::InCall(_),
                Event::Mic {
                    epoch,
                    event: CaptureEvent::Lost,
                },
            ) if *epoch == self.mic_epoch => {
                warn!("Capture lost mid-call; ending the call");
                self.enter_flow(FlowState::Ended, effects);
            }
            (FlowState::InCall(in_call), event) => {
                self.handle_in_call(in_call, event, effects);
            }
            _ => {}
        }
    }

    fn handle_in_call(&mut self, in_call: InCallState, event: &Event, effects: &mut Vec<Effect>) {
        match (in_call, event) {
            (_, Event::Command(Command::HangUp)) => {
                info!("Hanging up");
                self.ctx.partner = None; // settle() exits to ended
            }
            (_, Event::Ws(TransportEvent::Message(ServerMessage::Signal(payload)))) => {
                if self.engine_alive {
                    effects.push(Effect::SignalPeer(payload.data.clone()));
                } else {
                    debug!("Dropping inbound signal with no live engine");
                }
            }
            (
                InCallState::Active(NegotiationState::Connecting),
                Event::Timer(TimerId::NegotiationConnect),
            ) => {
                // A negotiation stalled this long usually means a stale
                // session: reset the control channel, not just the peer
                warn!("Timed out waiting for peer connection; resetting session");
                self.ctx.session_id = None;
                self.ctx.partner = None;
                // The restart below forces a fresh login; matching holds in
                // awaiting-connection until the new session is confirmed
                self.session = SessionState::Disconnected;
                self.enter_flow(
                    FlowState::Matching(MatchingState::AwaitingConnection),
                    effects,
                );
                effects.push(Effect::StartTransport);
            }
            (_, Event::Peer(peer_event)) => {
                if peer_event.generation != self.peer_generation {
                    debug!("Ignoring stale peer event");
                    return;
                }
                match (in_call, &peer_event.kind) {
                    (_, PeerEventKind::Signal(data)) => {
                        if let Some(partner) = &self.ctx.partner {
                            effects.push(Effect::SendWs(ClientMessage::Signal {
                                to: partner.session_id.clone(),
                                data: data.clone(),
                            }));
                        }
                    }
                    (
                        InCallState::Active(NegotiationState::Connecting),
                        PeerEventKind::Connected,
                    ) => {
                        info!("Call connected");
                        effects.push(Effect::CancelTimer(TimerId::NegotiationConnect));
                        self.flow =
                            FlowState::InCall(InCallState::Active(NegotiationState::Connected));
                        if let Some(partner) = &self.ctx.partner {
                            effects.push(Effect::Notify(Notification::CallEstablished {
                                match_id: partner.match_id,
                            }));
                        }
                    }
                    (_, PeerEventKind::RemoteStream(stream)) => {
                        self.ctx.remote_stream = Some(stream.clone());
                    }
                    (InCallState::Active(_), PeerEventKind::Closed) => {
                        info!("Peer session closed");
                        self.enter_in_call_disconnected(effects);
                    }
                    (InCallState::Active(_), PeerEventKind::Error(err)) => {
                        error!("Peer session error: {}", err);
                        self.enter_in_call_disconnected(effects);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Apply condition-driven transitions until nothing changes
    fn settle(&mut self, effects: &mut Vec<Effect>) {
        loop {
            match self.flow {
                // A partner pushed while waiting (e.g. a reconnection resumed
                // an existing match) jumps the flow forward without an
                // explicit matching request
                FlowState::PreMatch { .. } if self.ctx.partner.is_some() => {
                    info!("Partner already assigned; skipping the matching request");
                    self.enter_flow(FlowState::MicSetup, effects);
                }
                FlowState::PreMatch {
                    wait,
                    lobby: LobbyState::Connecting,
                } if self.session == SessionState::Active => {
                    self.flow = FlowState::PreMatch {
                        wait,
                        lobby: LobbyState::Lobby,
                    };
                }
                FlowState::MicSetup if self.ctx.mic_stream.is_some() => {
                    self.enter_flow(
                        FlowState::Matching(MatchingState::AwaitingConnection),
                        effects,
                    );
                }
                FlowState::Matching(_) if self.ctx.partner.is_some() => {
                    self.enter_flow(
                        FlowState::InCall(InCallState::Active(NegotiationState::Connecting)),
                        effects,
                    );
                }
                FlowState::Matching(MatchingState::AwaitingConnection)
                    if self.session == SessionState::Active =>
                {
                    info!("Requesting a match");
                    self.flow = FlowState::Matching(MatchingState::AwaitingMatch);
                    effects.push(Effect::SendWs(ClientMessage::Match));
                }
                // No match requests while disconnected; the request is
                // re-sent once the session is confirmed active again
                FlowState::Matching(MatchingState::AwaitingMatch)
                    if self.session != SessionState::Active =>
                {
                    self.flow = FlowState::Matching(MatchingState::AwaitingConnection);
                }
                FlowState::InCall(_) if self.ctx.partner.is_none() => {
                    self.enter_flow(FlowState::Ended, effects);
                }
                FlowState::InCall(InCallState::Disconnected)
                    if self.session == SessionState::Active =>
                {
                    // Fresh engine; the broken one has already been torn down
                    self.start_engine(effects);
                }
                _ => break,
            }
        }
    }

    /// Leave the current flow state and enter `next`, running exit and entry
    /// effects. Timers are scoped to the state that started them.
    fn enter_flow(&mut self, next: FlowState, effects: &mut Vec<Effect>) {
        self.exit_flow(effects);
        self.flow = next;
        match next {
            FlowState::PreMatch { .. } => {
                effects.push(Effect::StartTimer(
                    TimerId::ReadyWait,
                    self.config.ready_wait,
                ));
            }
            FlowState::MicSetup => {
                info!("Requesting microphone");
                // Prime the audio output from the user gesture that got us
                // here, per autoplay policy
                effects.push(Effect::PrimeAudio);
                self.mic_epoch += 1;
                self.mic = MicState::Active;
                effects.push(Effect::AcquireMic {
                    epoch: self.mic_epoch,
                });
            }
            FlowState::Matching(_) => {
                info!("Matching");
                // Sub-state promotion and the match request happen in settle()
            }
            FlowState::InCall(_) => {
                info!("Call starting");
                self.ctx.start_time = Some(self.now);
                effects.push(Effect::PlayCue(Cue::Connected));
                effects.push(Effect::EngageGuard);
                self.start_engine(effects);
            }
            FlowState::Ended => {
                let duration = self
                    .ctx
                    .start_time
                    .map(|t| self.now.duration_since(t))
                    .unwrap_or_default();
                self.ended_duration = Some(duration);
                info!("Call ended after {:?}", duration);
                effects.push(Effect::PlayCue(Cue::Ended));
                effects.push(Effect::Notify(Notification::CallEnded { duration }));
                self.release_mic();
                self.ctx.remote_stream = None;
            }
        }
    }

    fn exit_flow(&mut self, effects: &mut Vec<Effect>) {
        match self.flow {
            FlowState::PreMatch { .. } => {
                effects.push(Effect::CancelTimer(TimerId::ReadyWait));
            }
            FlowState::InCall(_) => {
                self.stop_engine(effects);
                effects.push(Effect::DisengageGuard);
            }
            _ => {}
        }
    }

    fn start_engine(&mut self, effects: &mut Vec<Effect>) {
        debug_assert!(!self.engine_alive, "overlapping negotiation engines");
        self.peer_generation += 1;
        self.engine_alive = true;
        self.flow = FlowState::InCall(InCallState::Active(NegotiationState::Connecting));
        effects.push(Effect::StartPeer {
            generation: self.peer_generation,
            options: PeerOptions {
                initiator: self.ctx.should_initiate,
                local_stream: self.ctx.mic_stream.clone(),
                relay_config: self.ctx.ice_servers.clone(),
            },
        });
        effects.push(Effect::StartTimer(
            TimerId::NegotiationConnect,
            self.config.negotiation_connect,
        ));
    }

    fn stop_engine(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelTimer(TimerId::NegotiationConnect));
        if self.engine_alive {
            self.engine_alive = false;
            effects.push(Effect::StopPeer);
        }
    }

    fn enter_in_call_disconnected(&mut self, effects: &mut Vec<Effect>) {
        self.stop_engine(effects);
        self.flow = FlowState::InCall(InCallState::Disconnected);
    }

    fn release_mic(&mut self) {
        // Dropping the last handle releases the device
        self.mic = MicState::None;
        self.ctx.mic_stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Counts;

    fn machine() -> CallMachine {
        CallMachine::new(CallConfig::default(), Instant::now()).0
    }

    fn ws(msg: ServerMessage) -> Event {
        Event::Ws(TransportEvent::Message(msg))
    }

    #[test]
    fn test_entry_effects_start_transport_and_timer() {
        let (_, effects) = CallMachine::new(CallConfig::default(), Instant::now());
        assert!(matches!(effects[0], Effect::StartTransport));
        assert!(matches!(
            effects[1],
            Effect::StartTimer(TimerId::ReadyWait, _)
        ));
    }

    #[test]
    fn test_connect_fetches_token_and_logs_in() {
        let mut m = machine();
        let effects = m.handle(Event::Ws(TransportEvent::Connected), Instant::now());
        assert_eq!(m.session(), SessionState::LoggingIn);
        assert!(matches!(effects[..], [Effect::FetchToken]));

        let effects = m.handle(Event::Token(Ok("tok".into())), Instant::now());
        assert_eq!(m.session(), SessionState::AwaitingPartner);
        assert!(matches!(
            effects[..],
            [Effect::SendWs(ClientMessage::Login { .. })]
        ));
    }

    #[test]
    fn test_info_counts_are_stored() {
        let mut m = machine();
        m.handle(
            ws(ServerMessage::Info {
                counts: Counts {
                    matched: 2,
                    answering_questions: 3,
                    lobby: 1,
                },
            }),
            Instant::now(),
        );
        assert_eq!(m.context().talking_count, Some(2));
        assert_eq!(m.context().online_count, Some(6));
    }

    #[test]
    fn test_session_id_is_stored_and_used_for_login() {
        let mut m = machine();
        m.handle(
            ws(ServerMessage::Session {
                session_id: "sid-1".into(),
            }),
            Instant::now(),
        );
        assert_eq!(m.context().session_id.as_deref(), Some("sid-1"));

        m.handle(Event::Ws(TransportEvent::Connected), Instant::now());
        let effects = m.handle(Event::Token(Ok("tok".into())), Instant::now());
        match &effects[..] {
            [Effect::SendWs(ClientMessage::Login { session_id, .. })] => {
                assert_eq!(session_id.as_deref(), Some("sid-1"));
            }
            other => panic!("unexpected effects: {:?}", other),
        }
    }

    #[test]
    fn test_server_error_is_fatal() {
        let mut m = machine();
        let effects = m.handle(
            ws(ServerMessage::Error {
                message: "nope".into(),
                code: Some(400),
            }),
            Instant::now(),
        );
        assert!(matches!(
            effects[..],
            [Effect::Fatal(FatalError::Server { .. })]
        ));
    }

    #[test]
    fn test_token_failure_is_fatal() {
        let mut m = machine();
        m.handle(Event::Ws(TransportEvent::Connected), Instant::now());
        let effects = m.handle(Event::Token(Err("offline".into())), Instant::now());
        assert!(matches!(
            effects[..],
            [Effect::Fatal(FatalError::TokenFetch(_))]
        ));
    }
}
