//! WebSocket transport for the relay.
//!
//! One live link at a time. Each link runs a read, write and ping task;
//! when the read side ends without a local close, or a connect fails, the
//! reconnect hook hands control back to the connection manager.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meshrelay_protocol::RelayMessage;
use meshrelay_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::pumps::read::LinkEnd;
use crate::pumps::{self, FrameTx};
use crate::reconnection::ReconnectHook;
use crate::transport::{ConnectFuture, ReconnectProvider, RelayTransport, TransportError};
use crate::types::ReconnectConfig;

/// Capacity of the outbound frame queue.
const SEND_BUFFER_SIZE: usize = 256;

/// Capacity of the inbound message queue.
const INBOUND_BUFFER_SIZE: usize = 256;

struct Link {
    frames: FrameTx,
    cancel: CancellationToken,
}

type LinkSlot = Arc<Mutex<Option<Link>>>;

fn slot_alive(slot: &LinkSlot) -> bool {
    lock(slot).as_ref().is_some_and(|l| !l.cancel.is_cancelled())
}

/// [`RelayTransport`] over a WebSocket.
pub struct WsTransport {
    link: LinkSlot,
    hook: ReconnectHook,
    inbound_tx: mpsc::Sender<RelayMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<RelayMessage>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::with_reconnect_config(ReconnectConfig::default())
    }

    /// Creates a transport whose post-drop delay follows `config`.
    pub fn with_reconnect_config(config: ReconnectConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_SIZE);
        Self {
            link: Arc::new(Mutex::new(None)),
            hook: ReconnectHook::new(config),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Takes the receiver for messages arriving from the relay.
    ///
    /// Messages keep flowing into the same queue across reconnects.
    /// Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<RelayMessage>> {
        lock(&self.inbound_rx).take()
    }

    /// Returns `true` while a link is open.
    pub fn is_connected(&self) -> bool {
        slot_alive(&self.link)
    }

    /// Queues a message on the current link.
    pub async fn send(&self, msg: &RelayMessage) -> Result<(), TransportError> {
        let json = msg.to_json()?;
        let frames = lock(&self.link)
            .as_ref()
            .filter(|l| !l.cancel.is_cancelled())
            .map(|l| l.frames.clone())
            .ok_or(TransportError::Closed)?;
        frames
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Closes the current link. No reconnect follows.
    pub fn close(&self) {
        self.hook.cancel_pending();
        if let Some(link) = lock(&self.link).take() {
            link.cancel.cancel();
        }
    }

    async fn open(&self, url: &str) -> Result<(), TransportError> {
        self.close();

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            match tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await {
                Ok(connected) => connected,
                Err(e) => {
                    debug!("relay connect failed: {e}");
                    let slot = Arc::clone(&self.link);
                    self.hook.link_lost(LinkEnd::Refused, move || slot_alive(&slot));
                    return Err(e.into());
                }
            };

        let link = self.spawn_link(ws_stream);
        if let Some(stale) = lock(&self.link).replace(link) {
            stale.cancel.cancel();
        }
        debug!("relay link open");
        Ok(())
    }

    fn spawn_link<S>(&self, ws_stream: S) -> Link
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Sink<WsMessage, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (sink, stream) = ws_stream.split();
        let (frames, frames_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let cancel = CancellationToken::new();

        tokio::spawn(pumps::write::write_pump(sink, frames_rx, cancel.clone()));
        tokio::spawn(pumps::ping::ping_pump(frames.clone(), cancel.clone()));

        let hook = self.hook.clone();
        let inbound = self.inbound_tx.clone();
        let read_frames = frames.clone();
        let read_cancel = cancel.clone();
        let slot = Arc::clone(&self.link);
        tokio::spawn(async move {
            let end = pumps::read::read_pump(stream, read_frames, inbound, read_cancel.clone()).await;
            read_cancel.cancel();
            hook.link_lost(end, move || slot_alive(&slot));
        });

        Link { frames, cancel }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayTransport for WsTransport {
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a> {
        Box::pin(self.open(url))
    }

    fn set_reconnect_provider(&self, provider: Option<Arc<dyn ReconnectProvider>>) {
        if provider.is_none() {
            self.hook.cancel_pending();
        }
        self.hook.set_provider(provider);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
