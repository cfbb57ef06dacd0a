//! Relay hub server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket, and
//! relays text frames between all connected clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use meshrelay_protocol::constants::{
    DEFAULT_HUB_PORT, HUB_STATUS_INTERVAL, WS_HANDSHAKE_TIMEOUT, WS_MAX_MESSAGE_SIZE,
};

use crate::ServerError;
use crate::connection;
use crate::registry::{HubStatus, Registry};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// TCP port to listen on, all interfaces (0 = OS-assigned).
    pub port: u16,
    /// Interval between status reports.
    pub status_interval: Duration,
    /// Time a client gets to finish the WebSocket upgrade.
    pub handshake_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HUB_PORT,
            status_interval: HUB_STATUS_INTERVAL,
            handshake_timeout: WS_HANDSHAKE_TIMEOUT,
        }
    }
}

/// The relay hub.
///
/// Owns the session registry; every connection task shares it through a
/// single mutex.
pub struct RelayHub {
    config: HubConfig,
    registry: Arc<Mutex<Registry>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl RelayHub {
    /// Binds the listen socket. Call [`run`](Self::run) to start accepting.
    pub async fn bind(config: HubConfig) -> Result<Arc<Self>, ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            config,
            registry: Arc::new(Mutex::new(Registry::new())),
            listener: Mutex::new(Some(listener)),
            local_addr,
            cancel: CancellationToken::new(),
        }))
    }

    /// Binds and runs the hub in a background task.
    pub async fn start(
        config: HubConfig,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), ServerError>>), ServerError> {
        let hub = Self::bind(config).await?;
        let runner = Arc::clone(&hub);
        let handle = tokio::spawn(async move { runner.run().await });
        Ok((hub, handle))
    }

    /// Returns the address the hub is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Returns a snapshot of announced peers.
    pub async fn status(&self) -> HubStatus {
        self.registry.lock().await.status()
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        tracing::info!("relay hub listening on ws://{}", self.local_addr);

        tokio::spawn(status_loop(
            Arc::clone(&self.registry),
            self.config.status_interval,
            self.cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay hub shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = hub.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(peer = %peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and registers its session.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = tokio::time::timeout(
            self.config.handshake_timeout,
            accept_async_with_config(stream, Some(ws_config)),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;

        let (sender, rx) = connection::channel();
        let id = self.registry.lock().await.insert(peer_addr, sender.clone());
        tracing::info!(session = id, peer = %peer_addr, "client connected");

        connection::spawn_connection(
            ws_stream,
            id,
            peer_addr,
            sender,
            rx,
            Arc::clone(&self.registry),
            self.cancel.clone(),
        );
        Ok(())
    }
}

/// Logs the announced peers every `interval`. Silent while nobody has
/// announced an id.
async fn status_loop(registry: Arc<Mutex<Registry>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let status = registry.lock().await.status();
                if status.peers.is_empty() {
                    continue;
                }
                tracing::info!(sessions = status.session_count, "status: {} peer(s) connected", status.peers.len());
                for peer in &status.peers {
                    tracing::info!("  • {} ({} agents)", peer.id, peer.agents);
                }
            }
        }
    }
}
