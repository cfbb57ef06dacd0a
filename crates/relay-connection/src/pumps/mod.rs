//! Socket tasks behind [`WsTransport`](crate::WsTransport).

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;

use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

/// Outbound frame queue shared by the pumps.
pub(crate) type FrameTx = tokio::sync::mpsc::Sender<WsMessage>;
