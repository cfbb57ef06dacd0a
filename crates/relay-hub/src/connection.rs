//! Per-client connection: read/write pumps, keepalive, send buffering.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use serde_json::Value;

use meshrelay_protocol::{Presence, is_truthy, value_text};
use meshrelay_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT};

use crate::SEND_BUFFER_SIZE;
use crate::registry::{Registry, SessionId};

/// Handle for queueing frames to one connected client.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`. The write pump is the
/// only task that touches the socket sink.
#[derive(Debug, Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Queues a pre-serialized text frame.
    ///
    /// Returns `Err` if the buffer is full or the connection is gone.
    pub fn send_text(&self, frame: Utf8Bytes) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Text(frame))
            .map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Creates the send channel for a new connection.
pub(crate) fn channel() -> (Sender, mpsc::Receiver<WsMessage>) {
    let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
    (Sender { tx }, rx)
}

/// Spawns the read and write pumps for an accepted WebSocket.
///
/// The session must already be registered under `id`. When the read pump
/// exits the session is removed from the registry and the write pump is
/// stopped.
pub(crate) fn spawn_connection<S>(
    ws_stream: S,
    id: SessionId,
    peer_addr: SocketAddr,
    sender: Sender,
    rx: mpsc::Receiver<WsMessage>,
    registry: Arc<Mutex<Registry>>,
    hub_cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let cancel = hub_cancel.child_token();
    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    tokio::spawn(async move {
        read_pump(ws_stream, id, &sender, &registry, cancel.clone()).await;
        cancel.cancel();

        let removed = registry.lock().await.remove(id);
        let who = removed
            .as_ref()
            .and_then(|s| s.announced_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(session = id, peer = %peer_addr, "client disconnected: {who}");
    });
}

/// Write pump: drains the send channel and sends keepalive pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: parses inbound frames, records presence, and fans out.
async fn read_pump<S>(
    mut stream: S,
    id: SessionId,
    sender: &Sender,
    registry: &Mutex<Registry>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                tracing::warn!(session = id, "no traffic within keepalive window, closing");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Text(text) => relay_text(id, &text, registry).await,
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Binary(data) => {
                                tracing::debug!(session = id, len = data.len(), "ignoring binary frame");
                            }
                            WsMessage::Close(_) => break,
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session = id, "WebSocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Handles one text frame: parse, update presence, and forward to every
/// other session.
///
/// The decoded value is reserialized with its key order intact. Only
/// frames that are not JSON (or are `null`) are dropped; the connection
/// stays open.
async fn relay_text(id: SessionId, text: &str, registry: &Mutex<Registry>) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(Value::Null) => {
            tracing::warn!(session = id, "invalid message: null frame");
            return;
        }
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session = id, "invalid message: {e}");
            return;
        }
    };

    let relayed: Utf8Bytes = match serde_json::to_string(&frame) {
        Ok(json) => json.into(),
        Err(e) => {
            tracing::warn!(session = id, "failed to reserialize message: {e}");
            return;
        }
    };

    let mut reg = registry.lock().await;
    reg.observe(id, &Presence::from_value(&frame));

    let who = reg
        .get(id)
        .and_then(|s| s.announced_id.as_deref())
        .unwrap_or("unknown");
    let msg_type = frame.get("type").map_or_else(|| "undefined".to_string(), value_text);
    match frame.get("to").filter(|v| is_truthy(v)) {
        Some(to) => tracing::info!("{who} → {msg_type} → {}", value_text(to)),
        None => tracing::info!("{who} → {msg_type}"),
    }

    reg.fan_out(id, &relayed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (sender, rx) = channel();
        assert!(sender.is_connected());
        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender.send_text("x".into()).is_err());
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let registry = Mutex::new(Registry::new());
        let (a, _rx_a) = channel();
        let (b, mut rx_b) = channel();
        let addr: SocketAddr = ([127, 0, 0, 1], 1).into();
        let id_a = registry.lock().await.insert(addr, a);
        registry.lock().await.insert(addr, b);

        relay_text(id_a, "{not json", &registry).await;
        assert!(rx_b.try_recv().is_err());

        relay_text(id_a, r#"{"type":"ping"}"#, &registry).await;
        assert!(matches!(rx_b.try_recv(), Ok(WsMessage::Text(_))));
    }

    fn sessions(registry: &mut Registry) -> (SessionId, mpsc::Receiver<WsMessage>) {
        let addr: SocketAddr = ([127, 0, 0, 1], 1).into();
        let (a, _rx_a) = channel();
        let (b, rx_b) = channel();
        let id_a = registry.insert(addr, a);
        registry.insert(addr, b);
        (id_a, rx_b)
    }

    fn relayed(rx: &mut mpsc::Receiver<WsMessage>) -> Option<String> {
        match rx.try_recv() {
            Ok(WsMessage::Text(t)) => Some(t.as_str().to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn frames_are_relayed_verbatim() {
        let mut reg = Registry::new();
        let (id_a, mut rx_b) = sessions(&mut reg);
        let registry = Mutex::new(reg);

        for frame in [
            r#"{"from":"agent-1","type":"presence","data":{"agents":["a"]}}"#,
            r#"{"type":"x","zeta":1,"alpha":2}"#,
            r#"{"type":"x","data":null}"#,
            r#"{"to":"b","data":{"z":1,"a":[3,2,1]},"type":"chat"}"#,
        ] {
            relay_text(id_a, frame, &registry).await;
            assert_eq!(relayed(&mut rx_b).as_deref(), Some(frame));
        }
    }

    #[tokio::test]
    async fn loosely_typed_frames_are_relayed() {
        let mut reg = Registry::new();
        let (id_a, mut rx_b) = sessions(&mut reg);
        let registry = Mutex::new(reg);

        let numeric_from = r#"{"type":"x","from":42}"#;
        relay_text(id_a, numeric_from, &registry).await;
        assert_eq!(relayed(&mut rx_b).as_deref(), Some(numeric_from));
        assert_eq!(
            registry.lock().await.get(id_a).unwrap().announced_id.as_deref(),
            Some("42")
        );

        let untyped = r#"{"from":"a","data":{}}"#;
        relay_text(id_a, untyped, &registry).await;
        assert_eq!(relayed(&mut rx_b).as_deref(), Some(untyped));
        assert_eq!(
            registry.lock().await.get(id_a).unwrap().announced_id.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn null_frame_is_dropped() {
        let mut reg = Registry::new();
        let (id_a, mut rx_b) = sessions(&mut reg);
        let registry = Mutex::new(reg);

        relay_text(id_a, "null", &registry).await;
        assert!(relayed(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn write_pump_stops_on_cancel() {
        use futures_util::sink;

        let (sink_tx, mut sink_rx) = mpsc::channel::<WsMessage>(16);
        let cancel = CancellationToken::new();

        let sink = sink::unfold(sink_tx, |tx, msg: WsMessage| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>(tx)
        });
        let sink = Box::pin(sink);

        let (_tx, rx) = mpsc::channel(16);
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            write_pump(sink, rx, c).await;
        });

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        // Closing an unfold sink emits nothing; the channel just ends.
        assert!(sink_rx.recv().await.is_none());
    }
}
