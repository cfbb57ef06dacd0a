//! Ping pump: periodic keepalive pings.

use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use meshrelay_protocol::constants::WS_PING_PERIOD;

use super::FrameTx;

/// Queues a ping every [`WS_PING_PERIOD`] until cancelled.
///
/// A full queue skips the tick; the read pump's deadline decides liveness.
pub(crate) async fn ping_pump(frames: FrameTx, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match frames.try_send(WsMessage::Ping(Vec::new().into())) {
                    Ok(()) => trace!("ping queued"),
                    Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => trace!("send queue full, skipping ping"),
                    Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}
