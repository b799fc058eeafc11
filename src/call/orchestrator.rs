//! Orchestrator runtime
//!
//! Owns the state machine, the event queue, and every live resource handle
//! (transport, negotiation engine, timers). Events from all sources funnel
//! into one queue and are processed one at a time; the effects each
//! transition returns are executed here, synchronously and in order, before
//! the next event is taken. That ordering is what guarantees a broken
//! engine's teardown completes before its replacement starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::{CuePlayer, MicDriver};
use crate::auth::TokenProvider;
use crate::network::{Transport, TransportHandle};

use super::error::FatalError;
use super::event::{Command, Effect, Event, Notification, PeerEvent, TimerId};
use super::guard::HangupGuard;
use super::machine::CallMachine;
use super::peer::{PeerDriver, PeerHandle};
use super::CallConfig;

/// Capability drivers injected into the orchestrator. Everything with a side
/// effect crosses one of these boundaries, so tests can script all of them.
pub struct Drivers {
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn TokenProvider>,
    pub mic: Arc<dyn MicDriver>,
    pub peer: Arc<dyn PeerDriver>,
    pub cues: Arc<dyn CuePlayer>,
    pub guard: Arc<dyn HangupGuard>,
}

/// Outcome of a completed call flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub duration: Duration,
}

/// Command handle for the embedder (UI, CLI). Cheap to clone; commands are
/// queued like any other event.
#[derive(Clone)]
pub struct CallController {
    events: mpsc::UnboundedSender<Event>,
}

impl CallController {
    /// The explicit user gesture that starts matching
    pub fn start_matching(&self) {
        let _ = self.events.send(Event::Command(Command::StartMatching));
    }

    /// End the current call cleanly
    pub fn hang_up(&self) {
        let _ = self.events.send(Event::Command(Command::HangUp));
    }

    /// Report user activity; drives the presence heartbeat
    pub fn activity(&self) {
        let _ = self.events.send(Event::Command(Command::Activity));
    }
}

/// Drives one call flow from start to ended (or fatal error)
pub struct CallOrchestrator {
    machine: CallMachine,
    drivers: Drivers,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    notifications: mpsc::UnboundedSender<Notification>,
    entry_effects: Vec<Effect>,
    transport: Option<Box<dyn TransportHandle>>,
    peer: Option<Box<dyn PeerHandle>>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl CallOrchestrator {
    /// Build an orchestrator plus its command handle and notification stream
    pub fn new(
        config: CallConfig,
        drivers: Drivers,
    ) -> (
        Self,
        CallController,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (machine, entry_effects) = CallMachine::new(config, Instant::now());
        let controller = CallController {
            events: events_tx.clone(),
        };
        let orchestrator = Self {
            machine,
            drivers,
            events_tx,
            events_rx,
            notifications: notify_tx,
            entry_effects,
            transport: None,
            peer: None,
            timers: HashMap::new(),
        };
        (orchestrator, controller, notify_rx)
    }

    /// Run the call flow to completion. Resources are torn down on every
    /// exit path, fatal errors included.
    pub async fn run(mut self) -> Result<CallSummary, FatalError> {
        let entry = std::mem::take(&mut self.entry_effects);
        let result = self.drive(entry).await;
        self.shutdown();
        result
    }

    async fn drive(&mut self, entry: Vec<Effect>) -> Result<CallSummary, FatalError> {
        self.apply(entry)?;
        while !self.machine.is_ended() {
            let Some(event) = self.events_rx.recv().await else {
                return Err(FatalError::Internal("event queue closed".to_string()));
            };
            // Activity only feeds the heartbeat; the machine never sees it
            if matches!(event, Event::Command(Command::Activity)) {
                if let Some(transport) = &self.transport {
                    transport.notify_activity();
                }
                continue;
            }
            let effects = self.machine.handle(event, Instant::now());
            self.apply(effects)?;
        }
        Ok(CallSummary {
            duration: self.machine.ended_duration().unwrap_or_default(),
        })
    }

    fn apply(&mut self, effects: Vec<Effect>) -> Result<(), FatalError> {
        for effect in effects {
            match effect {
                Effect::StartTransport => {
                    if let Some(old) = self.transport.take() {
                        // Emits a final Disconnected so the session region
                        // resets before the replacement connects
                        old.stop();
                    }
                    let tx = self.events_tx.clone();
                    let handle = self.drivers.transport.start(Box::new(move |ev| {
                        let _ = tx.send(Event::Ws(ev));
                    }));
                    self.transport = Some(handle);
                }
                Effect::SendWs(msg) => {
                    if let Some(transport) = &self.transport {
                        transport.send(msg);
                    } else {
                        debug!("No transport to send on; dropping message");
                    }
                }
                Effect::FetchToken => {
                    let tx = self.events_tx.clone();
                    self.drivers.tokens.fetch_token(Box::new(move |result| {
                        let _ = tx.send(Event::Token(result));
                    }));
                }
                Effect::AcquireMic { epoch } => {
                    let tx = self.events_tx.clone();
                    self.drivers.mic.acquire(Box::new(move |ev| {
                        let _ = tx.send(Event::Mic { epoch, event: ev });
                    }));
                }
                Effect::StartPeer { generation, options } => {
                    if let Some(mut old) = self.peer.take() {
                        old.destroy();
                    }
                    let tx = self.events_tx.clone();
                    let handle = self.drivers.peer.start(
                        options,
                        Box::new(move |kind| {
                            let _ = tx.send(Event::Peer(PeerEvent { generation, kind }));
                        }),
                    );
                    self.peer = Some(handle);
                }
                Effect::StopPeer => {
                    if let Some(mut peer) = self.peer.take() {
                        peer.destroy();
                    }
                }
                Effect::SignalPeer(data) => {
                    if let Some(peer) = &self.peer {
                        peer.signal(data);
                    }
                }
                Effect::StartTimer(id, duration) => {
                    let tx = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        let _ = tx.send(Event::Timer(id));
                    });
                    if let Some(old) = self.timers.insert(id, task) {
                        old.abort();
                    }
                }
                Effect::CancelTimer(id) => {
                    if let Some(task) = self.timers.remove(&id) {
                        task.abort();
                    }
                }
                Effect::PrimeAudio => {
                    self.drivers.cues.prime();
                }
                Effect::PlayCue(cue) => {
                    self.drivers.cues.play(cue);
                }
                Effect::EngageGuard => {
                    let tx = self.events_tx.clone();
                    self.drivers.guard.engage(Box::new(move || {
                        let _ = tx.send(Event::Command(Command::HangUp));
                    }));
                }
                Effect::DisengageGuard => {
                    self.drivers.guard.disengage();
                }
                Effect::Notify(notification) => {
                    let _ = self.notifications.send(notification);
                }
                Effect::Fatal(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.destroy();
        }
        if let Some(transport) = self.transport.take() {
            transport.stop();
        }
        self.drivers.guard.disengage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::audio::{CaptureEvent, CaptureSink, MicStream, NullCuePlayer};
    use crate::auth::StaticTokenProvider;
    use super::super::guard::NullGuard;
    use crate::network::{EventSink, TransportEvent};
    use crate::protocol::{ClientMessage, PartnerInfo, PartnerPayload, ServerMessage};

    use super::super::peer::{PeerOptions, PeerSink};

    /// Transport whose events are injected by the test through captured sinks
    #[derive(Default)]
    struct ScriptedTransport {
        sinks: Mutex<Vec<Arc<EventSink>>>,
        starts: AtomicUsize,
    }

    impl ScriptedTransport {
        async fn sink(&self, index: usize) -> Arc<EventSink> {
            loop {
                if let Some(sink) = self.sinks.lock().get(index).cloned() {
                    return sink;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn start(&self, sink: EventSink) -> Box<dyn TransportHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().push(Arc::new(sink));
            Box::new(ScriptedHandle)
        }
    }

    struct ScriptedHandle;

    impl TransportHandle for ScriptedHandle {
        fn send(&self, _msg: ClientMessage) {}
        fn notify_activity(&self) {}
        fn stop(&self) {}
    }

    struct InstantMic;

    impl MicDriver for InstantMic {
        fn acquire(&self, sink: CaptureSink) {
            sink(CaptureEvent::Acquired(MicStream::detached("fake", 48000, 1)));
        }
    }

    /// Engine that never connects
    struct InertPeerDriver;

    impl PeerDriver for InertPeerDriver {
        fn start(&self, _options: PeerOptions, _sink: PeerSink) -> Box<dyn PeerHandle> {
            Box::new(InertPeer)
        }
    }

    struct InertPeer;

    impl PeerHandle for InertPeer {
        fn signal(&self, _data: serde_json::Value) {}
        fn destroy(&mut self) {}
    }

    fn drivers(transport: Arc<ScriptedTransport>) -> Drivers {
        Drivers {
            transport,
            tokens: Arc::new(StaticTokenProvider::new("tok")),
            mic: Arc::new(InstantMic),
            peer: Arc::new(InertPeerDriver),
            cues: Arc::new(NullCuePlayer),
            guard: Arc::new(NullGuard),
        }
    }

    async fn next_matching<F>(
        notes: &mut mpsc::UnboundedReceiver<Notification>,
        pred: F,
    ) -> Notification
    where
        F: Fn(&Notification) -> bool,
    {
        loop {
            let note = notes.recv().await.expect("notification stream closed");
            if pred(&note) {
                return note;
            }
        }
    }

    /// Given a flow that never reaches the server
    /// When the patience window elapses on the paused clock
    /// Then the wait notification fires without any real sleeping
    #[tokio::test(start_paused = true)]
    async fn test_ready_wait_timer_fires_on_paused_clock() {
        let transport = Arc::new(ScriptedTransport::default());
        let (orch, _ctl, mut notes) =
            CallOrchestrator::new(CallConfig::default(), drivers(transport.clone()));
        let flow = tokio::spawn(orch.run());

        let start = tokio::time::Instant::now();
        next_matching(&mut notes, |n| matches!(n, Notification::WaitTimedOut)).await;
        assert!(tokio::time::Instant::now() - start >= CallConfig::default().ready_wait);

        flow.abort();
    }

    /// Given a call whose negotiation never completes
    /// When the connect window elapses on the paused clock
    /// Then the engine is torn down and the control channel restarts instead
    /// of the call being reported established
    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_restarts_transport() {
        let transport = Arc::new(ScriptedTransport::default());
        let (orch, ctl, mut notes) =
            CallOrchestrator::new(CallConfig::default(), drivers(transport.clone()));
        let flow = tokio::spawn(orch.run());

        let sink = transport.sink(0).await;
        sink(TransportEvent::Connected);
        // Let the token fetch and login drain before the server frames land
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink(TransportEvent::Message(ServerMessage::Session {
            session_id: "sid".to_string(),
        }));
        sink(TransportEvent::Message(ServerMessage::Partner(
            PartnerPayload::default(),
        )));
        sink(TransportEvent::Message(ServerMessage::Ready));
        next_matching(&mut notes, |n| matches!(n, Notification::ReadyToMatch)).await;

        ctl.start_matching();
        sink(TransportEvent::Message(ServerMessage::Partner(
            PartnerPayload {
                partner: Some(PartnerInfo {
                    session_id: "them".to_string(),
                    match_id: 7,
                    state: None,
                }),
                should_initiate: true,
                prompts: Vec::new(),
                ice_servers: Vec::new(),
            },
        )));

        // The inert engine never connects; the timer resets the channel
        tokio::time::timeout(Duration::from_secs(60), async {
            while transport.starts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("transport was not restarted");

        while let Ok(note) = notes.try_recv() {
            assert!(!matches!(note, Notification::CallEstablished { .. }));
        }

        flow.abort();
    }
}
