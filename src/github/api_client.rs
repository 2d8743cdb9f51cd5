//! GitHub REST client.
//!
//! [`UpstreamApi`] is the seam the token broker and the aggregation engine
//! depend on; [`GitHubClient`] is the reqwest implementation, built once at
//! startup and shared by every component.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::GitHubError;

const ACCEPT_HEADER: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated access to the GitHub REST surface.
///
/// Paths are relative to the API base URL and may carry a query string.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn get(&self, path: &str, token: &str) -> Result<Value, GitHubError>;

    async fn post(&self, path: &str, body: Option<&Value>, token: &str)
        -> Result<Value, GitHubError>;

    /// Returns whether the upstream accepted the deletion. Never fails.
    async fn delete(&self, path: &str, token: &str) -> bool;
}

/// Format an `Authorization` header value, adding `Bearer ` unless the
/// caller already chose a scheme.
pub fn authorization_value(token: &str) -> String {
    if token.starts_with("Bearer ") || token.starts_with("token ") {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

/// GitHub API client backed by a single shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl GitHubClient {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, GitHubError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", authorization_value(token))
            .header("Accept", ACCEPT_HEADER)
            .header("User-Agent", &self.user_agent)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn read_json(response: reqwest::Response, method: &str, path: &str) -> Result<Value, GitHubError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(method, path, status = status.as_u16(), body = %body, "GitHub API request failed");
            return Err(GitHubError::UpstreamRequestFailed {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl UpstreamApi for GitHubClient {
    async fn get(&self, path: &str, token: &str) -> Result<Value, GitHubError> {
        let response = self
            .request(reqwest::Method::GET, path, token)
            .send()
            .await?;
        Self::read_json(response, "GET", path).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value, GitHubError> {
        let mut request = self.request(reqwest::Method::POST, path, token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        Self::read_json(response, "POST", path).await
    }

    async fn delete(&self, path: &str, token: &str) -> bool {
        match self
            .request(reqwest::Method::DELETE, path, token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!(path, error = %e, "GitHub API DELETE request failed");
                false
            }
        }
    }
}

// Response types

#[derive(Debug, Deserialize)]
pub(crate) struct ListReposResponse {
    pub repositories: Vec<Repository>,
}

/// A repository visible to an installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    pub html_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRef {
    pub login: String,
}

/// An entry from the issue listing endpoint, which also returns pull requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<UserRef>,
}

impl Issue {
    /// The issue listing conflates issues and pull requests; PR links point at `/pull/`.
    pub fn is_pull_request(&self) -> bool {
        self.html_url.contains("/pull/")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub user: Option<UserRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: u64,
    #[serde(default)]
    pub environment: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator: Option<UserRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentStatus {
    pub state: String,
}

/// The account an installation belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub login: String,
    pub id: u64,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccountType {
    User,
    Organization,
    Bot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepositorySelection {
    All,
    Selected,
}

/// `GET /app/installations/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallationDetails {
    pub id: u64,
    pub account: Account,
    #[serde(default)]
    pub permissions: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<String>,
    pub repository_selection: RepositorySelection,
}
