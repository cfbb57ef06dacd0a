//! Transport capability used by the connection manager.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_tungstenite::tungstenite;

/// Errors from a relay transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] meshrelay_protocol::ProtocolError),

    #[error("connection closed")]
    Closed,

    #[error("connect timed out")]
    Timeout,
}

/// Boxed future returned by [`RelayTransport::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Boxed future returned by [`ReconnectProvider::attempt_reconnect`].
pub type ReconnectFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Called by a transport when its connection drops unexpectedly or never
/// comes up.
///
/// Resolves to `true` once a fresh connection is up. The provider owns the
/// retry policy; a transport never loops on `false`.
pub trait ReconnectProvider: Send + Sync + 'static {
    fn attempt_reconnect(&self) -> ReconnectFuture<'_>;
}

/// A connection that accepts a presigned URL.
pub trait RelayTransport: Send + Sync + 'static {
    /// Opens a connection to `url`, replacing any current one.
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a>;

    /// Installs or removes the hook consulted on drops and failed connects.
    fn set_reconnect_provider(&self, provider: Option<Arc<dyn ReconnectProvider>>);
}
