//! Development signaling server
//!
//! Speaks the production wire protocol with first-come-first-served pairing:
//! enough server to exercise login, matching, signal relay, heartbeats, and
//! reconnection end to end. The real matcher lives elsewhere.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    ClientMessage, Counts, IceServer, PartnerInfo, PartnerPayload, Prompt, ServerMessage,
    SignalPayload,
};

use super::error::NetworkError;

/// Conversation prompts handed to each new match
const STOCK_PROMPTS: [&str; 3] = [
    "What surprised you most this week?",
    "What's something you changed your mind about recently?",
    "What do you wish more people asked you about?",
];

const STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct DevServerConfig {
    /// Clients silent for longer than this are evicted
    pub idle_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

enum Outbound {
    Frame(ServerMessage),
    Close,
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<Outbound>,
    partner: Option<String>,
    last_active: Instant,
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<String, ClientEntry>,
    queue: VecDeque<String>,
}

/// Development/test signaling server
pub struct DevSignalingServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: DevServerConfig,
    state: Arc<RwLock<ServerState>>,
    next_match_id: Arc<AtomicU64>,
}

impl DevSignalingServer {
    pub async fn bind(addr: &str, config: DevServerConfig) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
            state: Arc::new(RwLock::new(ServerState::default())),
            next_match_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), NetworkError> {
        info!("Signaling server listening on {}", self.local_addr);

        let sweep_state = self.state.clone();
        let idle_timeout = self.config.idle_timeout;
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                evict_idle(&sweep_state, idle_timeout).await;
            }
        });

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New signaling connection from {}", peer_addr);
                    let state = self.state.clone();
                    let next_match_id = self.next_match_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state, next_match_id).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn evict_idle(state: &Arc<RwLock<ServerState>>, idle_timeout: Duration) {
    let state = state.read().await;
    let now = Instant::now();
    for (id, client) in &state.clients {
        if now.duration_since(client.last_active) > idle_timeout {
            debug!("Evicting idle client {}", id);
            let _ = client.tx.send(Outbound::Close);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<RwLock<ServerState>>,
    next_match_id: Arc<AtomicU64>,
) -> Result<(), NetworkError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::WebSocket(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut session_id: Option<String> = None;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                process_message(msg, &state, &next_match_id, &tx, &mut session_id)
                                    .await;
                            }
                            Err(e) => warn!("Invalid client frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            out = rx.recv() => {
                match out {
                    Some(Outbound::Frame(msg)) => {
                        let text = serde_json::to_string(&msg)?;
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    if let Some(sid) = session_id {
        drop_client(&state, &sid).await;
    }
    Ok(())
}

async fn process_message(
    msg: ClientMessage,
    state: &Arc<RwLock<ServerState>>,
    next_match_id: &Arc<AtomicU64>,
    tx: &mpsc::UnboundedSender<Outbound>,
    session_id: &mut Option<String>,
) {
    // Any inbound frame counts as activity
    if let Some(sid) = session_id.as_ref() {
        let mut guard = state.write().await;
        if let Some(client) = guard.clients.get_mut(sid) {
            client.last_active = Instant::now();
        }
    }

    match msg {
        ClientMessage::Login { .. } => {
            if session_id.is_some() {
                return;
            }
            let sid = Uuid::new_v4().to_string();
            {
                let mut guard = state.write().await;
                guard.clients.insert(
                    sid.clone(),
                    ClientEntry {
                        tx: tx.clone(),
                        partner: None,
                        last_active: Instant::now(),
                    },
                );
            }
            info!("Client {} logged in", sid);
            let _ = tx.send(Outbound::Frame(ServerMessage::Session {
                session_id: sid.clone(),
            }));
            // Current match state; null partner for a fresh login. Clients
            // treat this as the session-active confirmation.
            let _ = tx.send(Outbound::Frame(ServerMessage::Partner(
                PartnerPayload::default(),
            )));
            let _ = tx.send(Outbound::Frame(ServerMessage::Ready));
            *session_id = Some(sid);
            broadcast_info(state).await;
        }

        ClientMessage::Match => {
            let Some(sid) = session_id.clone() else {
                return;
            };
            {
                let mut guard = state.write().await;
                let already_matched = guard
                    .clients
                    .get(&sid)
                    .map_or(true, |c| c.partner.is_some());
                if already_matched || guard.queue.contains(&sid) {
                    return;
                }
                guard.queue.push_back(sid);
            }
            try_pair(state, next_match_id).await;
        }

        ClientMessage::Signal { to, data } => {
            let Some(sid) = session_id.clone() else {
                return;
            };
            let guard = state.read().await;
            if let Some(target) = guard.clients.get(&to) {
                let _ = target.tx.send(Outbound::Frame(ServerMessage::Signal(
                    SignalPayload {
                        to: None,
                        from: Some(sid),
                        data,
                    },
                )));
            } else {
                debug!("Signal for unknown session {}", to);
            }
        }

        ClientMessage::Heartbeat {} => {} // activity already recorded
    }
}

/// Pair the two oldest waiters still connected and unmatched
async fn try_pair(state: &Arc<RwLock<ServerState>>, next_match_id: &Arc<AtomicU64>) {
    let mut guard = state.write().await;
    let pair = {
        let ServerState { clients, queue } = &mut *guard;
        let mut waiting: Vec<String> = Vec::new();
        queue.retain(|sid| {
            let eligible = clients
                .get(sid)
                .is_some_and(|c| c.partner.is_none());
            if eligible && waiting.len() < 2 {
                waiting.push(sid.clone());
                return false;
            }
            eligible
        });
        if waiting.len() == 2 {
            Some((waiting[0].clone(), waiting[1].clone()))
        } else {
            // Put a lone waiter back at the front
            for sid in waiting.into_iter().rev() {
                queue.push_front(sid);
            }
            None
        }
    };

    let Some((first, second)) = pair else {
        return;
    };
    let match_id = next_match_id.fetch_add(1, Ordering::Relaxed);
    info!("Matched {} with {} (match {})", first, second, match_id);

    if let Some(client) = guard.clients.get_mut(&first) {
        client.partner = Some(second.clone());
    }
    if let Some(client) = guard.clients.get_mut(&second) {
        client.partner = Some(first.clone());
    }
    // The earlier waiter originates the offer
    send_partner(&guard, &first, &second, match_id, true);
    send_partner(&guard, &second, &first, match_id, false);
    drop(guard);
    broadcast_info(state).await;
}

fn send_partner(
    guard: &ServerState,
    to: &str,
    partner: &str,
    match_id: u64,
    should_initiate: bool,
) {
    if let Some(client) = guard.clients.get(to) {
        let payload = PartnerPayload {
            partner: Some(PartnerInfo {
                session_id: partner.to_string(),
                match_id,
                state: None,
            }),
            should_initiate,
            prompts: STOCK_PROMPTS
                .iter()
                .map(|text| Prompt {
                    text: text.to_string(),
                })
                .collect(),
            ice_servers: vec![IceServer {
                urls: vec![STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
        };
        let _ = client
            .tx
            .send(Outbound::Frame(ServerMessage::Partner(payload)));
    }
}

async fn drop_client(state: &Arc<RwLock<ServerState>>, sid: &str) {
    let remnant = {
        let mut guard = state.write().await;
        guard.queue.retain(|id| id != sid);
        let removed = guard.clients.remove(sid);
        removed.and_then(|c| c.partner)
    };

    // The remaining party learns the match ended via a null partner
    if let Some(partner_id) = remnant {
        let mut guard = state.write().await;
        if let Some(partner) = guard.clients.get_mut(&partner_id) {
            partner.partner = None;
            let _ = partner.tx.send(Outbound::Frame(ServerMessage::Partner(
                PartnerPayload::default(),
            )));
        }
    }
    info!("Client {} disconnected", sid);
    broadcast_info(state).await;
}

async fn broadcast_info(state: &Arc<RwLock<ServerState>>) {
    let guard = state.read().await;
    let matched = guard
        .clients
        .values()
        .filter(|c| c.partner.is_some())
        .count() as u32;
    let lobby = guard.clients.len() as u32 - matched;
    let msg = ServerMessage::Info {
        counts: Counts {
            matched,
            answering_questions: 0,
            lobby,
        },
    };
    for client in guard.clients.values() {
        let _ = client.tx.send(Outbound::Frame(msg.clone()));
    }
}
