//! Read pump: delivers relay messages and tracks liveness.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meshrelay_protocol::RelayMessage;
use meshrelay_protocol::constants::WS_PONG_WAIT;

use super::FrameTx;

/// Why a read pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkEnd {
    /// The link was closed locally.
    Cancelled,
    /// The peer closed the socket or the stream ended.
    Closed,
    /// Nothing arrived within [`WS_PONG_WAIT`].
    Timeout,
    /// The socket reported an error.
    Error,
    /// The connect or upgrade never completed.
    Refused,
}

impl LinkEnd {
    /// Returns `true` if the link went away without a local close.
    pub(crate) fn is_unexpected(self) -> bool {
        self != LinkEnd::Cancelled
    }
}

/// Reads frames until the link ends.
///
/// Any inbound frame resets the liveness deadline. Text frames are parsed
/// as [`RelayMessage`] and queued on `inbound`; frames that do not parse
/// are dropped.
pub(crate) async fn read_pump<S>(
    mut stream: S,
    frames: FrameTx,
    inbound: mpsc::Sender<RelayMessage>,
    cancel: CancellationToken,
) -> LinkEnd
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            // A local close must win over the peer's close reply.
            biased;

            _ = cancel.cancelled() => return LinkEnd::Cancelled,

            () = &mut deadline => {
                warn!("relay silent for {}s, dropping link", WS_PONG_WAIT.as_secs());
                return LinkEnd::Timeout;
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("relay read error: {e}");
                        return LinkEnd::Error;
                    }
                    None => {
                        debug!("relay stream ended");
                        return LinkEnd::Closed;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match frame {
                    WsMessage::Text(text) => deliver(&text, &inbound),
                    WsMessage::Ping(data) => {
                        let _ = frames.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Pong(_) => trace!("pong"),
                    WsMessage::Close(frame) => {
                        debug!(?frame, "relay sent close");
                        return LinkEnd::Closed;
                    }
                    WsMessage::Binary(_) | WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

fn deliver(text: &str, inbound: &mpsc::Sender<RelayMessage>) {
    let msg = match RelayMessage::parse(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("dropping unparseable relay frame: {e}");
            return;
        }
    };
    trace!(msg_type = %msg.msg_type, "relay message");
    if let Err(e) = inbound.try_send(msg) {
        warn!("inbound queue unavailable, dropping message: {e}");
    }
}
