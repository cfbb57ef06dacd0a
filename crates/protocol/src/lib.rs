//! Wire protocol shared by the relay hub and relay clients.

pub mod constants;
pub mod envelope;
pub mod events;

// Re-export primary types for convenience.
pub use envelope::{Presence, ProtocolError, RelayMessage, is_truthy, value_text};
pub use events::{AuthRequiredNotice, AuthRequiredReason, RELAY_AUTH_REQUIRED};
