//! Installation setup callback and per-tenant integration management.

use axum::{
    extract::{Extension, Query, State},
    response::Redirect,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use super::session::TenantId;
use crate::db::{
    InstallationCredential, InstallationMetadata, MetadataFact, NewInstallationCredential, Provider,
};
use crate::github::webhook::WebhookRepository;
use crate::github::RepositorySelection;
use crate::AppState;

/// Tenant recorded when the setup redirect carries no `state`.
const DEFAULT_ORGANIZATION: &str = "default";

#[derive(Debug, Deserialize)]
pub struct InstallationCallbackQuery {
    pub installation_id: Option<String>,
    pub setup_action: Option<String>,
    pub state: Option<String>,
}

/// Where the browser lands after the setup redirect.
fn integrations_url(state: &AppState, outcome: &str) -> String {
    format!(
        "{}/integrations?{}",
        state.config.session.url.trim_end_matches('/'),
        outcome
    )
}

fn valid_installation_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 20 && id.bytes().all(|b| b.is_ascii_digit())
}

/// GET /api/github/callback - GitHub App setup redirect target
///
/// Always answers with a redirect, never a JSON body.
pub async fn installation_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InstallationCallbackQuery>,
) -> Redirect {
    let outcome = match params.setup_action.as_deref() {
        Some("cancelled") => {
            tracing::info!(installation_id = ?params.installation_id, "GitHub App setup cancelled");
            "error=setup_cancelled"
        }
        Some("install") => match params.installation_id.as_deref() {
            Some(id) if valid_installation_id(id) => {
                let organization_id = params
                    .state
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_ORGANIZATION);

                match complete_installation(&state, id, organization_id).await {
                    Ok(credential) => {
                        tracing::info!(
                            installation_id = %credential.id,
                            organization_id = %credential.organization_id,
                            "GitHub App installation connected"
                        );
                        "success=github_connected"
                    }
                    Err(e) => {
                        tracing::error!(installation_id = id, error = %e, "GitHub App installation failed");
                        "error=installation_failed"
                    }
                }
            }
            _ => "error=invalid_callback",
        },
        _ => "error=invalid_callback",
    };

    Redirect::to(&integrations_url(&state, outcome))
}

/// Exchange credentials for a freshly installed app and upsert its row.
async fn complete_installation(
    state: &AppState,
    installation_id: &str,
    organization_id: &str,
) -> Result<InstallationCredential, ApiError> {
    let details = state.broker.installation_details(installation_id).await?;
    let token = state.broker.token_for(installation_id).await?;

    let mut metadata = InstallationMetadata::default();
    metadata.apply(MetadataFact::Grant {
        account: details.account,
        permissions: details.permissions,
        events: details.events,
        repository_selection: details.repository_selection,
    });

    // The listing only feeds the status view; the installation is stored without it
    match state.engine.list_repositories(&token.token).await {
        Ok(repositories) => {
            metadata.apply(MetadataFact::Repositories(
                repositories
                    .into_iter()
                    .map(|repo| WebhookRepository {
                        id: repo.id,
                        name: repo.name,
                        full_name: repo.full_name,
                        private: repo.private,
                    })
                    .collect(),
            ));
        }
        Err(e) => {
            tracing::warn!(installation_id, error = %e, "Could not list repositories for new installation");
        }
    }

    let credential = state
        .vault
        .create(NewInstallationCredential {
            id: installation_id.to_string(),
            organization_id: organization_id.to_string(),
            provider: Provider::GitHub,
            access_token: state.cipher.encrypt(&token.token)?,
            refresh_token: state.cipher.encrypt_optional(token.refresh_token.as_deref())?,
            metadata,
        })
        .await?;

    Ok(credential)
}

#[derive(Debug, Serialize)]
pub struct IntegrationStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_selection: Option<RepositorySelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl IntegrationStatus {
    fn disconnected() -> Self {
        Self {
            connected: false,
            installation_id: None,
            organization: None,
            repository_selection: None,
            repository_count: None,
            suspended: None,
            last_updated: None,
        }
    }
}

impl From<InstallationCredential> for IntegrationStatus {
    fn from(credential: InstallationCredential) -> Self {
        let organization = credential
            .metadata
            .account
            .as_ref()
            .map(|account| account.login.clone())
            .unwrap_or_else(|| "Unknown Organization".to_string());

        Self {
            connected: true,
            installation_id: Some(credential.id),
            organization: Some(organization),
            repository_selection: credential.metadata.repository_selection,
            repository_count: Some(credential.metadata.repositories.len()),
            suspended: Some(credential.metadata.suspended),
            last_updated: Some(credential.updated_at),
        }
    }
}

/// The tenant's most recently updated installation, if any.
pub(crate) async fn tenant_installation(
    state: &AppState,
    tenant: &TenantId,
) -> Result<Option<InstallationCredential>, ApiError> {
    let credentials = state.vault.find_by_organization_id(tenant.as_str()).await?;
    Ok(credentials.into_iter().next())
}

/// GET /api/integrations/github/status
pub async fn integration_status(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Result<Json<IntegrationStatus>, ApiError> {
    let status = match tenant_installation(&state, &tenant).await? {
        Some(credential) => IntegrationStatus::from(credential),
        None => IntegrationStatus::disconnected(),
    };
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// POST /api/integrations/github/disconnect
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let credential = tenant_installation(&state, &tenant)
        .await?
        .ok_or_else(|| ApiError::not_found("No GitHub integration found"))?;

    // The stored token dates from the callback; queries may have minted a
    // newer one that only the broker cache knows about
    let mut tokens = Vec::new();
    match state.cipher.decrypt(&credential.access_token) {
        Ok(token) => tokens.push(token),
        Err(e) => {
            tracing::warn!(installation_id = %credential.id, error = %e, "Stored token could not be decrypted for revocation");
        }
    }
    if let Some(live) = state.broker.invalidate(&credential.id) {
        if !tokens.contains(&live.token) {
            tokens.push(live.token);
        }
    }

    // Revocation is best effort; the row goes regardless
    for token in &tokens {
        if !state.broker.revoke(token).await {
            tracing::warn!(installation_id = %credential.id, "Failed to revoke GitHub installation token");
        }
    }

    state.vault.delete(&credential.id).await?;

    tracing::info!(
        installation_id = %credential.id,
        organization_id = %credential.organization_id,
        "GitHub integration disconnected"
    );
    Ok(Json(DisconnectResponse { success: true }))
}
