//! Network module
//!
//! The signaling transport (persistent control channel with automatic
//! reconnection) and a development signaling server that speaks the same
//! wire protocol.

mod dev_server;
mod error;
mod transport;

pub use dev_server::{DevServerConfig, DevSignalingServer};
pub use error::NetworkError;
pub use transport::{
    EventSink, SignalingConfig, SignalingHandle, SignalingTransport, Transport, TransportEvent,
    TransportHandle, HEARTBEAT_INTERVAL, RECONNECT_DELAY,
};
