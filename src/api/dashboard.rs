//! Dashboard query endpoints backed by the aggregation engine.
//!
//! Failures still answer with the endpoint's envelope, zeroed, plus an
//! `error` message, so clients can render an empty state.

use axum::{
    extract::{Extension, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use super::error::ApiError;
use super::installations::tenant_installation;
use super::session::TenantId;
use crate::github::aggregation::{
    AggregationEngine, DeploymentSummary, IssueSummary, PullRequestSummary, RepositoryOverview,
};
use crate::github::GitHubError;
use crate::AppState;

#[derive(Debug, Serialize)]
struct FailedQuery<T> {
    error: String,
    #[serde(flatten)]
    body: T,
}

fn respond<T: Serialize + Default>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            let status = err.status();
            let envelope = FailedQuery {
                error: err.message().to_string(),
                body: T::default(),
            };
            (status, Json(envelope)).into_response()
        }
    }
}

/// Resolve the tenant's installation token and run `query` with it.
async fn run_query<T, F, Fut>(state: &AppState, tenant: &TenantId, query: F) -> Result<T, ApiError>
where
    F: FnOnce(AggregationEngine, String) -> Fut,
    Fut: Future<Output = Result<T, GitHubError>>,
{
    let credential = tenant_installation(state, tenant)
        .await?
        .ok_or_else(|| ApiError::not_found("GitHub integration not found"))?;

    let token = state.broker.token_for(&credential.id).await?;

    query(state.engine.clone(), token.token).await.map_err(|e| {
        tracing::error!(installation_id = %credential.id, error = %e, "Failed to fetch repositories");
        ApiError::upstream("Failed to fetch repositories", e.upstream_status())
    })
}

/// GET /api/github/issues
pub async fn list_issues(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Response {
    respond::<IssueSummary>(
        run_query(&state, &tenant, |engine, token| async move { engine.issues(&token).await }).await,
    )
}

/// GET /api/github/pull-requests
pub async fn list_pull_requests(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Response {
    respond::<PullRequestSummary>(
        run_query(&state, &tenant, |engine, token| async move {
            engine.pull_requests(&token).await
        })
        .await,
    )
}

/// GET /api/github/deployments
pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Response {
    respond::<DeploymentSummary>(
        run_query(&state, &tenant, |engine, token| async move {
            engine.deployments(&token).await
        })
        .await,
    )
}

/// GET /api/github/repositories
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantId>,
) -> Response {
    respond::<RepositoryOverview>(
        run_query(&state, &tenant, |engine, token| async move {
            engine.repositories(&token).await
        })
        .await,
    )
}
