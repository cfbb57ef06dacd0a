//! Credential refresh through a federated-identity exchange.
//!
//! Two calls against the identity pool service: resolve an identity id for
//! the login token, then mint temporary credentials for that identity.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Credentials, FederatedIdentity, REFRESH_TIMEOUT};

const AMZ_JSON: &str = "application/x-amz-json-1.1";
const TARGET_HEADER: &str = "X-Amz-Target";
const GET_ID_TARGET: &str = "AWSCognitoIdentityService.GetId";
const GET_CREDENTIALS_TARGET: &str = "AWSCognitoIdentityService.GetCredentialsForIdentity";

/// Errors from a credential refresh.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("identity service error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("identity pool id has no region prefix: {0}")]
    InvalidPoolId(String),

    #[error("identity service returned no identity id")]
    NoIdentity,

    #[error("identity service returned no credentials")]
    NoCredentials,

    #[error("config has no federated identity to refresh with")]
    NoFederatedIdentity,

    #[error("credential refresh timed out")]
    Timeout,
}

/// Boxed future returned by [`CredentialRefresher::refresh`].
pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Credentials, RefreshError>> + Send + 'a>>;

/// Exchanges a federated identity for fresh temporary credentials.
pub trait CredentialRefresher: Send + Sync + 'static {
    fn refresh<'a>(&'a self, identity: &'a FederatedIdentity) -> RefreshFuture<'a>;
}

/// Refresher backed by the identity pool HTTP API.
pub struct CognitoRefresher {
    http: reqwest::Client,
    endpoint: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdRequest<'a> {
    identity_pool_id: &'a str,
    logins: HashMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdResponse {
    identity_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetCredentialsRequest<'a> {
    identity_id: &'a str,
    logins: HashMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCredentialsResponse {
    credentials: Option<IssuedCredentials>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IssuedCredentials {
    access_key_id: String,
    secret_key: String,
    session_token: Option<String>,
    expiration: Option<f64>,
}

impl From<IssuedCredentials> for Credentials {
    fn from(c: IssuedCredentials) -> Self {
        Credentials {
            access_key_id: c.access_key_id,
            secret_access_key: c.secret_key,
            session_token: c.session_token,
            expiration: c.expiration.map(|secs| secs.floor() as i64),
        }
    }
}

impl CognitoRefresher {
    /// Creates a refresher whose HTTP calls are bounded by [`REFRESH_TIMEOUT`].
    pub fn new() -> Result<Self, RefreshError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(AMZ_JSON));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REFRESH_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            endpoint: None,
        })
    }

    /// Pins the service endpoint instead of deriving it from the pool id (for testing).
    #[cfg(test)]
    pub(crate) fn with_endpoint(mut self, url: String) -> Self {
        self.endpoint = Some(url);
        self
    }

    fn endpoint_for(&self, identity_pool_id: &str) -> Result<String, RefreshError> {
        if let Some(url) = &self.endpoint {
            return Ok(url.clone());
        }
        identity_endpoint(identity_pool_id)
    }

    /// Performs one JSON-RPC style call against the identity service.
    async fn call<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        target: &'static str,
        body: &B,
    ) -> Result<R, RefreshError> {
        let resp = self
            .http
            .post(endpoint)
            .header(TARGET_HEADER, target)
            .body(serde_json::to_vec(body)?)
            .send()
            .await
            .map_err(map_http)?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(map_http)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn exchange(&self, identity: &FederatedIdentity) -> Result<Credentials, RefreshError> {
        let endpoint = self.endpoint_for(&identity.identity_pool_id)?;
        let logins = HashMap::from([(
            identity.provider_name.as_str(),
            identity.id_token.as_str(),
        )]);

        let id: GetIdResponse = self
            .call(
                &endpoint,
                GET_ID_TARGET,
                &GetIdRequest {
                    identity_pool_id: &identity.identity_pool_id,
                    logins: logins.clone(),
                },
            )
            .await?;
        let identity_id = id
            .identity_id
            .filter(|id| !id.is_empty())
            .ok_or(RefreshError::NoIdentity)?;
        debug!("resolved federated identity {identity_id}");

        let creds: GetCredentialsResponse = self
            .call(
                &endpoint,
                GET_CREDENTIALS_TARGET,
                &GetCredentialsRequest {
                    identity_id: &identity_id,
                    logins,
                },
            )
            .await?;

        creds
            .credentials
            .map(Credentials::from)
            .ok_or(RefreshError::NoCredentials)
    }
}

impl CredentialRefresher for CognitoRefresher {
    fn refresh<'a>(&'a self, identity: &'a FederatedIdentity) -> RefreshFuture<'a> {
        Box::pin(self.exchange(identity))
    }
}

fn map_http(e: reqwest::Error) -> RefreshError {
    if e.is_timeout() {
        RefreshError::Timeout
    } else {
        RefreshError::Http(e)
    }
}

/// Returns the identity service URL for a pool id of the form `region:uuid`.
fn identity_endpoint(identity_pool_id: &str) -> Result<String, RefreshError> {
    match identity_pool_id.split_once(':') {
        Some((region, _)) if !region.is_empty() => {
            Ok(format!("https://cognito-identity.{region}.amazonaws.com/"))
        }
        _ => Err(RefreshError::InvalidPoolId(identity_pool_id.to_string())),
    }
}
