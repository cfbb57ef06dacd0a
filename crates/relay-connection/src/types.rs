//! Public types for the relay connection manager.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use meshrelay_protocol::AuthRequiredNotice;

/// Upper bound on each federated-identity round-trip.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one transport connect call.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Temporary cloud credentials.
///
/// Always replaced as a whole; never patch individual fields.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Expiry as unix seconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_epoch_secs"
    )]
    pub expiration: Option<i64>,
}

impl Credentials {
    /// Returns `true` if the credentials carry an expiry at or before `now`.
    ///
    /// Credentials without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| now.timestamp() >= exp)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Accepts integral or fractional epoch seconds (the identity service
/// returns a JSON number that may carry a fraction).
fn deserialize_epoch_secs<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.map(|secs| secs.floor() as i64))
}

/// Identity-pool linkage used to mint fresh credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitoLink {
    pub identity_pool_id: String,
    pub provider_name: String,
}

/// Everything needed for one federated-identity exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct FederatedIdentity {
    pub identity_pool_id: String,
    pub provider_name: String,
    pub id_token: String,
}

impl fmt::Debug for FederatedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedIdentity")
            .field("identity_pool_id", &self.identity_pool_id)
            .field("provider_name", &self.provider_name)
            .field("id_token", &"<redacted>")
            .finish()
    }
}

/// Persisted configuration for one managed relay endpoint.
///
/// Serialized as `{arn, region, credentials, cognito?, idToken?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEndpointConfig {
    #[serde(rename = "arn", alias = "resourceId")]
    pub resource_id: String,
    pub region: String,
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognito: Option<CognitoLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl RelayEndpointConfig {
    /// Returns the federated identity, if both the pool link and an id
    /// token are present.
    pub fn federated_identity(&self) -> Option<FederatedIdentity> {
        let cognito = self.cognito.as_ref()?;
        let id_token = self.id_token.as_ref().filter(|t| !t.is_empty())?;
        Some(FederatedIdentity {
            identity_pool_id: cognito.identity_pool_id.clone(),
            provider_name: cognito.provider_name.clone(),
            id_token: id_token.clone(),
        })
    }
}

/// State of the logical relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// Expiry check, refresh, signing or transport connect in progress.
    Connecting,
    /// Transport reported a successful connect.
    Connected,
    /// Credentials expired and could not be refreshed; the user must
    /// re-authenticate.
    AuthRequired,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Published as `relay-auth-required` for the UI to prompt a login.
    AuthRequired(AuthRequiredNotice),
}

/// Retry policy for transport failures within one reconnect attempt.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
    /// Connect attempts per reconnect before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}
