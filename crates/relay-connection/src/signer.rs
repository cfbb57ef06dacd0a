//! SigV4 query-string presigning for the managed relay WebSocket endpoint.
//!
//! Pure functions: given credentials, a region, a resource id, an expiry
//! window, a timestamp and a session id, [`sign`] always produces the same
//! URL. [`presign_url`] fills in the current time and a fresh session id.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

use crate::types::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Service name in the credential scope and host.
pub const SERVICE_NAME: &str = "bedrock-agentcore";

/// Signing algorithm identifier.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Default validity window of a presigned URL.
pub const DEFAULT_EXPIRES_SECS: u32 = 300;

const SESSION_ID_PARAM: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";

/// RFC 3986 unreserved characters stay literal; everything else,
/// including `! ' ( ) *`, is percent-encoded.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Errors from presigning. These abort the connect attempt locally.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("missing access key id")]
    MissingAccessKey,

    #[error("missing secret access key")]
    MissingSecretKey,

    #[error("missing region")]
    MissingRegion,

    #[error("missing resource id")]
    MissingResourceId,

    #[error("invalid signing key")]
    InvalidKey,
}

/// Inputs to [`sign`].
#[derive(Debug, Clone, Copy)]
pub struct PresignRequest<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub resource_id: &'a str,
    pub expires_secs: u32,
    pub now: DateTime<Utc>,
    pub session_id: &'a str,
}

/// Percent-encodes a URI component (RFC 3986).
pub fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, URI_COMPONENT).to_string()
}

/// Returns the endpoint host for a region.
pub fn endpoint_host(region: &str) -> String {
    format!("{SERVICE_NAME}.{region}.amazonaws.com")
}

/// Builds a presigned `wss://` URL.
pub fn sign(req: &PresignRequest<'_>) -> Result<String, SignError> {
    let creds = req.credentials;
    if creds.access_key_id.is_empty() {
        return Err(SignError::MissingAccessKey);
    }
    if creds.secret_access_key.is_empty() {
        return Err(SignError::MissingSecretKey);
    }
    if req.region.is_empty() {
        return Err(SignError::MissingRegion);
    }
    if req.resource_id.is_empty() {
        return Err(SignError::MissingResourceId);
    }

    let host = endpoint_host(req.region);
    let path = format!("/runtimes/{}/ws", uri_encode(req.resource_id));
    let date_stamp = req.now.format("%Y%m%d").to_string();
    let amz_date = req.now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{date_stamp}/{}/{SERVICE_NAME}/aws4_request", req.region);
    let credential = format!("{}/{scope}", creds.access_key_id);

    let query = canonical_query(req, &credential, &amz_date);
    let canonical_request =
        format!("GET\n{path}\n{query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&creds.secret_access_key, &date_stamp, req.region, SERVICE_NAME)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "wss://{host}{path}?{query}&X-Amz-Signature={signature}"
    ))
}

/// Presigns with the current time and a fresh session id.
pub fn presign_url(
    credentials: &Credentials,
    region: &str,
    resource_id: &str,
    expires_secs: u32,
) -> Result<String, SignError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    sign(&PresignRequest {
        credentials,
        region,
        resource_id,
        expires_secs,
        now: Utc::now(),
        session_id: &session_id,
    })
}

/// Query string sorted by parameter name. The order is part of the
/// signature input.
fn canonical_query(req: &PresignRequest<'_>, credential: &str, amz_date: &str) -> String {
    let expires = req.expires_secs.to_string();
    let mut params: Vec<(&str, &str)> = vec![
        ("X-Amz-Algorithm", ALGORITHM),
        ("X-Amz-Credential", credential),
        ("X-Amz-Date", amz_date),
        ("X-Amz-Expires", expires.as_str()),
        ("X-Amz-SignedHeaders", "host"),
        (SESSION_ID_PARAM, req.session_id),
    ];
    if let Some(token) = req.credentials.session_token.as_deref().filter(|t| !t.is_empty()) {
        params.push(("X-Amz-Security-Token", token));
    }
    params.sort_by(|a, b| a.0.cmp(b.0));

    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
fn signing_key(
    secret: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, SignError> {
    let mut key = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
    for part in [region, service, "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    Ok(key)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
