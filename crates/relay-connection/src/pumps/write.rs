//! Write pump: the only task that touches the socket sink.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Drains queued frames into the socket until cancelled.
///
/// A close frame is sent on the way out unless the sink already failed.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!("relay write failed: {e}");
                    return;
                }
            }
        }
    }

    let _ = sink.close().await;
}
