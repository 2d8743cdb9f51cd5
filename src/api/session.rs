//! Session guard for tenant-facing endpoints.
//!
//! Sessions are issued by the application's auth service as HS256 JWTs signed
//! with `session.secret`, issued by `session.url`. The `sub` claim is the
//! opaque tenant (organization) id.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use crate::AppState;

/// Tenant the current request acts for. Inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iss: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Verify a session token and return its tenant.
pub fn verify_session_token(token: &str, secret: &str, issuer: &str) -> Option<TenantId> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer]);

    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()?;

    let tenant = data.claims.sub.trim();
    if tenant.is_empty() {
        return None;
    }
    Some(TenantId(tenant.to_string()))
}

pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Unauthorized"))?;

    let tenant = verify_session_token(token, &state.config.session.secret, &state.config.session.url)
        .ok_or_else(|| {
            tracing::debug!("Rejected invalid session token");
            ApiError::unauthorized("Unauthorized")
        })?;

    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

/// Mint a session token the way the auth service does.
#[cfg(test)]
pub(crate) fn session_token(secret: &str, issuer: &str, tenant: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = SessionClaims {
        sub: tenant.to_string(),
        iss: issuer.to_string(),
        exp: now + 3600,
        iat: Some(now),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
