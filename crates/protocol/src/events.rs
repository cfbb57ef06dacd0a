//! Notifications surfaced to UI collaborators.

use serde::{Deserialize, Serialize};

/// Event name emitted when relay credentials can no longer be refreshed.
pub const RELAY_AUTH_REQUIRED: &str = "relay-auth-required";

/// Why re-authentication is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequiredReason {
    CredentialsExpired,
}

/// Payload of the [`RELAY_AUTH_REQUIRED`] event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequiredNotice {
    pub reason: AuthRequiredReason,
}

impl AuthRequiredNotice {
    pub fn credentials_expired() -> Self {
        Self {
            reason: AuthRequiredReason::CredentialsExpired,
        }
    }

    /// Event name this payload is published under.
    pub fn event_name(&self) -> &'static str {
        RELAY_AUTH_REQUIRED
    }
}
