//! WebSocket broadcast hub for the mesh relay.
//!
//! Forwards every text frame to all other connected clients and tracks
//! each client's announced identity from the traffic it sends. No
//! handshake or auth; meant for a trusted local network.

mod connection;
mod registry;
mod server;

pub use connection::{SendError, Sender};
pub use registry::{ClientSession, HubStatus, PeerStatus, Registry, SessionId};
pub use server::{HubConfig, RelayHub};

/// Per-connection send buffer capacity. Frames beyond it are dropped for
/// that receiver.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay hub.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    #[error("hub already running")]
    AlreadyRunning,
}
