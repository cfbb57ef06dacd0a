use std::time::Duration;

/// Default hub listen port.
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Interval between hub status reports.
pub const HUB_STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Time to wait for any inbound traffic before a connection is considered dead.
///
/// Any frame (text, ping, pong) resets the deadline.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send keepalive pings (must be < [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Time allowed for a TCP client to complete the WebSocket upgrade.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Presence message type announced by mesh instances.
pub const MSG_TYPE_PRESENCE: &str = "presence";
