mod dashboard;
pub mod error;
mod installations;
pub mod session;
mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use error::{ApiError, ErrorCode};
pub use session::TenantId;

pub fn create_router(state: Arc<AppState>) -> Router {
    // GitHub-facing routes (webhook is HMAC-verified, callback is a browser redirect)
    let github_routes = Router::new()
        .route("/webhook", post(webhooks::github_webhook))
        .route("/callback", get(installations::installation_callback));

    // Tenant routes, protected by the session guard
    let api_routes = Router::new()
        .route("/github/issues", get(dashboard::list_issues))
        .route("/github/pull-requests", get(dashboard::list_pull_requests))
        .route("/github/deployments", get(dashboard::list_deployments))
        .route("/github/repositories", get(dashboard::list_repositories))
        .route("/integrations/github/status", get(installations::integration_status))
        .route("/integrations/github/disconnect", post(installations::disconnect))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::session_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/github", github_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
