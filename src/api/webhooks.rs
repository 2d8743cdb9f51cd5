//! Webhook ingress for GitHub App events.
//!
//! Verified deliveries are queued on the event bus and acknowledged; the
//! lifecycle worker applies them asynchronously.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::error::ApiError;
use crate::github::lifecycle::{INSTALLATION_EVENT, INSTALLATION_REPOSITORIES_EVENT};
use crate::github::webhook::{self, InstallationWebhook, WebhookError};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub message: &'static str,
}

/// Handle GitHub webhook deliveries
pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let received = webhook::authenticate(&headers, &body, &state.config.github.webhook_secret)
        .map_err(|e| {
            tracing::warn!(error = %e, "GitHub webhook rejected");
            e
        })?;
    tracing::debug!(event = %received.event, "GitHub webhook signature verified");

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(event = %received.event, error = %e, "Failed to parse GitHub webhook payload");
        WebhookError::MalformedPayload(e.to_string())
    })?;

    // Installation events must carry a complete installation object
    if received.event == INSTALLATION_EVENT || received.event == INSTALLATION_REPOSITORIES_EVENT {
        let parsed = InstallationWebhook::parse(&body)?;
        tracing::info!(
            event = %received.event,
            action = %parsed.action,
            installation_id = parsed.installation.id,
            "GitHub installation webhook received"
        );
    }

    state
        .events
        .publish_webhook(&received.event, received.delivery.clone(), payload)
        .await?;

    Ok(Json(WebhookAck {
        success: true,
        message: "Webhook processed successfully",
    }))
}
