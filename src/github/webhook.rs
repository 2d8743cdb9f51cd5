//! Webhook authentication and payload types.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use thiserror::Error;

use super::api_client::{Account, RepositorySelection};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing X-Hub-Signature-256 header")]
    MissingSignature,
    #[error("missing X-GitHub-Event header")]
    MissingEventType,
    #[error("webhook signature does not match")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

/// `sha256=` + hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        // HMAC accepts keys of any length
        Err(_) => unreachable!(),
    };
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature header against the raw body.
///
/// The MAC comparison is constant time.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    let signature = match signature_header.strip_prefix(SIGNATURE_PREFIX) {
        Some(sig) => sig,
        None => return false,
    };

    let expected = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(raw_body);

    mac.verify_slice(&expected).is_ok()
}

/// Signature and event type, both required before any MAC work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub signature: String,
    pub event: String,
    pub delivery: Option<String>,
}

pub fn extract_headers(headers: &HeaderMap) -> Result<WebhookHeaders, WebhookError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let signature = header(SIGNATURE_HEADER).ok_or(WebhookError::MissingSignature)?;
    let event = header(EVENT_HEADER).ok_or(WebhookError::MissingEventType)?;

    Ok(WebhookHeaders {
        signature,
        event,
        delivery: header(DELIVERY_HEADER),
    })
}

/// Check the headers, then the signature.
pub fn authenticate(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<WebhookHeaders, WebhookError> {
    let extracted = extract_headers(headers)?;
    if !verify(body, &extracted.signature, secret) {
        return Err(WebhookError::InvalidSignature);
    }
    Ok(extracted)
}

/// Installation object carried by `installation` and `installation_repositories` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookInstallation {
    pub id: u64,
    pub account: Account,
    #[serde(default)]
    pub permissions: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<String>,
    pub repository_selection: RepositorySelection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRepository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

/// Payload of the `installation` and `installation_repositories` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallationWebhook {
    pub action: String,
    pub installation: WebhookInstallation,
    pub sender: Account,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repositories_added: Option<Vec<WebhookRepository>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repositories_removed: Option<Vec<WebhookRepository>>,
}

impl InstallationWebhook {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))
    }
}
