//! Signaling transport
//!
//! Owns one control-channel connection to the matching server. Reconnects
//! forever on drop with a fixed delay; protocol violations are escalated to
//! the owner instead of retried. Outbound messages are fire-and-forget:
//! anything sent while disconnected is dropped, never queued, so callers
//! re-send after reconfirming the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};

/// Fixed delay before each reconnect attempt. No backoff growth and no retry
/// ceiling: the control channel keeps trying for as long as the user waits.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Idle window for the presence heartbeat. User activity sends at most one
/// heartbeat per window so the server can evict truly-idle clients without
/// active ones flooding it.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connectivity and message events emitted by the transport, in source order
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { code: Option<u16> },
    Message(ServerMessage),
    /// Fatal: an inbound frame that does not decode as a known message kind.
    /// The reconnect loop does not cover this; it stops the transport.
    ProtocolError(String),
}

/// Callback receiving transport events
pub type EventSink = Box<dyn Fn(TransportEvent) + Send + Sync + 'static>;

/// Transport factory, injectable so tests can fake connectivity
pub trait Transport: Send + Sync {
    fn start(&self, sink: EventSink) -> Box<dyn TransportHandle>;
}

/// A running transport instance
pub trait TransportHandle: Send + Sync {
    /// Fire-and-forget send; dropped with a debug log while disconnected
    fn send(&self, msg: ClientMessage);
    /// Report user activity; emits a throttled presence heartbeat
    fn notify_activity(&self);
    /// Stop the transport. Idempotent. Emits a final `Disconnected` if the
    /// channel was up.
    fn stop(&self);
}

/// Leading-edge rate limiter for the presence heartbeat
pub(crate) struct HeartbeatThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl HeartbeatThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True at most once per interval, starting with the first call
    pub(crate) fn should_send(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

/// Configuration for the WebSocket signaling transport
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: RECONNECT_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// WebSocket signaling transport
pub struct SignalingTransport {
    config: SignalingConfig,
}

impl SignalingTransport {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

impl Transport for SignalingTransport {
    fn start(&self, sink: EventSink) -> Box<dyn TransportHandle> {
        let sink = Arc::new(sink);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let throttle = Arc::new(Mutex::new(HeartbeatThrottle::new(
            self.config.heartbeat_interval,
        )));

        let task = tokio::spawn(run_channel(
            self.config.clone(),
            sink.clone(),
            outbound_rx,
            connected.clone(),
            throttle.clone(),
        ));

        Box::new(SignalingHandle {
            outbound: outbound_tx,
            connected,
            sink,
            throttle,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running WebSocket transport
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
    sink: Arc<EventSink>,
    throttle: Arc<Mutex<HeartbeatThrottle>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TransportHandle for SignalingHandle {
    fn send(&self, msg: ClientMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            debug!("Dropping outbound message while disconnected");
            return;
        }
        let _ = self.outbound.send(msg);
    }

    fn notify_activity(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if self.throttle.lock().should_send(Instant::now()) {
            let _ = self.outbound.send(ClientMessage::Heartbeat {});
        }
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        // The aborted task cannot report the close itself
        if self.connected.swap(false, Ordering::SeqCst) {
            (self.sink)(TransportEvent::Disconnected { code: None });
        }
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connect/read loop: idle -> connecting -> connected -> reconnecting -> ...
async fn run_channel(
    config: SignalingConfig,
    sink: Arc<EventSink>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    connected: Arc<AtomicBool>,
    throttle: Arc<Mutex<HeartbeatThrottle>>,
) {
    loop {
        match connect_async(&config.url).await {
            Ok((ws, _)) => {
                // Anything queued during the gap was sent while disconnected
                // and must not survive the reconnect
                while outbound.try_recv().is_ok() {}

                info!("Signaling channel connected: {}", config.url);
                connected.store(true, Ordering::SeqCst);
                // A fresh connection opens a fresh heartbeat window
                throttle.lock().reset();
                sink(TransportEvent::Connected);

                let (mut write, mut read) = ws.split();
                let code = loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => sink(TransportEvent::Message(msg)),
                                    Err(e) => {
                                        connected.store(false, Ordering::SeqCst);
                                        sink(TransportEvent::ProtocolError(format!(
                                            "undecodable frame: {}",
                                            e
                                        )));
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break frame.map(|f| u16::from(f.code));
                            }
                            Some(Ok(_)) => {} // ping/pong/binary
                            Some(Err(e)) => {
                                warn!("Signaling read error: {}", e);
                                break None;
                            }
                            None => break None,
                        },
                        out = outbound.recv() => match out {
                            Some(msg) => {
                                let text = match serde_json::to_string(&msg) {
                                    Ok(t) => t,
                                    Err(e) => {
                                        warn!("Failed to encode outbound message: {}", e);
                                        continue;
                                    }
                                };
                                if write.send(Message::Text(text)).await.is_err() {
                                    break None;
                                }
                            }
                            // Handle dropped; shut down cleanly
                            None => return,
                        },
                    }
                };

                connected.store(false, Ordering::SeqCst);
                warn!("Signaling channel dropped (code {:?})", code);
                sink(TransportEvent::Disconnected { code });
            }
            Err(e) => {
                debug!("Signaling connect failed: {}", e);
            }
        }

        tokio::time::sleep(config.reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_leading_edge() {
        let mut throttle = HeartbeatThrottle::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(throttle.should_send(t0));
        assert!(!throttle.should_send(t0 + Duration::from_secs(3)));
        assert!(!throttle.should_send(t0 + Duration::from_secs(9)));
        assert!(throttle.should_send(t0 + Duration::from_secs(10)));
        assert!(!throttle.should_send(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_throttle_reset() {
        let mut throttle = HeartbeatThrottle::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(throttle.should_send(t0));
        throttle.reset();
        assert!(throttle.should_send(t0 + Duration::from_secs(1)));
    }
}
