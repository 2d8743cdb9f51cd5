//! Fan-out aggregation across every repository visible to an installation.
//!
//! One aggregation lists the installation's repositories, then fetches issues,
//! pull requests and deployments for each of them concurrently. Every call
//! after the listing goes through a per-request [`Semaphore`], so the number of
//! requests in flight against the upstream never exceeds
//! [`AggregationSettings::max_concurrency`].
//!
//! Failures below the listing degrade: the affected repository contributes
//! empty lists (or `pending` deployment states) and the rest of the result is
//! unaffected. A failed listing fails the whole aggregation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::api_client::{
    Deployment, DeploymentStatus, Issue, ListReposResponse, PullRequest, Repository, UpstreamApi,
    UserRef,
};
use super::GitHubError;
use crate::config::AggregationConfig;

/// State assumed for a deployment without a (fetched) status.
const DEFAULT_DEPLOYMENT_STATE: &str = "pending";

/// Environment assumed for a deployment that does not name one.
const DEFAULT_ENVIRONMENT: &str = "production";

/// Fan-out limits for a single aggregation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSettings {
    pub max_concurrency: usize,
    pub page_size: u32,
    pub deployment_page_size: u32,
    pub deployment_status_lookups: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            page_size: 100,
            deployment_page_size: 10,
            deployment_status_lookups: 5,
        }
    }
}

impl From<&AggregationConfig> for AggregationSettings {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            page_size: config.page_size,
            deployment_page_size: config.deployment_page_size,
            deployment_status_lookups: config.deployment_status_lookups,
        }
    }
}

/// Which sub-resources to fetch per repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Include {
    pub issues: bool,
    pub pull_requests: bool,
    pub deployments: bool,
}

impl Include {
    pub const ALL: Include = Include {
        issues: true,
        pull_requests: true,
        deployments: true,
    };

    pub const ISSUES: Include = Include {
        issues: true,
        pull_requests: false,
        deployments: false,
    };

    pub const PULL_REQUESTS: Include = Include {
        issues: false,
        pull_requests: true,
        deployments: false,
    };

    pub const DEPLOYMENTS: Include = Include {
        issues: false,
        pull_requests: false,
        deployments: true,
    };
}

/// Repository identity attached to every aggregated entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RepositoryRef {
    pub name: String,
    pub full_name: String,
    pub html_url: String,
}

impl From<&Repository> for RepositoryRef {
    fn from(repo: &Repository) -> Self {
        Self {
            name: repo.name.clone(),
            full_name: repo.full_name.clone(),
            html_url: repo.html_url.clone(),
        }
    }
}

/// A deployment with its latest known state.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: u64,
    pub environment: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub creator: Option<UserRef>,
    pub description: Option<String>,
}

impl DeploymentRecord {
    fn new(deployment: Deployment, state: Option<String>) -> Self {
        Self {
            id: deployment.id,
            environment: deployment
                .environment
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            state: state.unwrap_or_else(|| DEFAULT_DEPLOYMENT_STATE.to_string()),
            created_at: deployment.created_at,
            updated_at: deployment.updated_at,
            creator: deployment.creator,
            description: deployment.description,
        }
    }
}

/// Everything fetched for one repository. Request-scoped.
#[derive(Debug, Clone)]
pub struct RepositoryData {
    pub repository: Repository,
    pub open_issues: Vec<Issue>,
    pub closed_issues: Vec<Issue>,
    pub open_pull_requests: Vec<PullRequest>,
    pub closed_pull_requests: Vec<PullRequest>,
    /// Newest first, as returned upstream.
    pub deployments: Vec<DeploymentRecord>,
}

// Projections

#[derive(Debug, Clone, Serialize)]
pub struct IssueEntry {
    #[serde(flatten)]
    pub issue: Issue,
    pub repository: RepositoryRef,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueSummary {
    pub issues: Vec<IssueEntry>,
    pub total: usize,
    pub open: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequestEntry {
    #[serde(flatten)]
    pub pull_request: PullRequest,
    pub repository: RepositoryRef,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullRequestSummary {
    pub pull_requests: Vec<PullRequestEntry>,
    pub total: usize,
    pub open: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEntry {
    #[serde(flatten)]
    pub deployment: DeploymentRecord,
    pub repository: RepositoryRef,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentSummary {
    pub deployments: Vec<DeploymentEntry>,
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub pending: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StateCounts {
    pub open: usize,
    pub closed: usize,
    pub total: usize,
}

impl StateCounts {
    fn new(open: usize, closed: usize) -> Self {
        Self {
            open,
            closed,
            total: open + closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentDeployment {
    pub environment: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositorySummary {
    pub repository: Repository,
    pub issues: StateCounts,
    pub pull_requests: StateCounts,
    pub deployments: Vec<RecentDeployment>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositoryOverview {
    pub repositories: Vec<RepositorySummary>,
    pub total: usize,
}

/// Issues across all repositories, newest first. Pull requests returned by
/// the issue listing are dropped.
pub fn summarize_issues(data: &[RepositoryData]) -> IssueSummary {
    let mut issues: Vec<IssueEntry> = data
        .iter()
        .flat_map(|repo| {
            let repository = RepositoryRef::from(&repo.repository);
            repo.open_issues
                .iter()
                .chain(repo.closed_issues.iter())
                .filter(|issue| !issue.is_pull_request())
                .map(move |issue| IssueEntry {
                    issue: issue.clone(),
                    repository: repository.clone(),
                })
        })
        .collect();

    // Stable: equal timestamps keep discovery order
    issues.sort_by(|a, b| b.issue.created_at.cmp(&a.issue.created_at));

    let open = issues.iter().filter(|e| e.issue.state == "open").count();
    let closed = issues.iter().filter(|e| e.issue.state == "closed").count();

    IssueSummary {
        total: issues.len(),
        open,
        closed,
        issues,
    }
}

pub fn summarize_pull_requests(data: &[RepositoryData]) -> PullRequestSummary {
    let mut pull_requests: Vec<PullRequestEntry> = data
        .iter()
        .flat_map(|repo| {
            let repository = RepositoryRef::from(&repo.repository);
            repo.open_pull_requests
                .iter()
                .chain(repo.closed_pull_requests.iter())
                .map(move |pr| PullRequestEntry {
                    pull_request: pr.clone(),
                    repository: repository.clone(),
                })
        })
        .collect();

    pull_requests.sort_by(|a, b| b.pull_request.created_at.cmp(&a.pull_request.created_at));

    let open = pull_requests
        .iter()
        .filter(|e| e.pull_request.state == "open")
        .count();
    let closed = pull_requests
        .iter()
        .filter(|e| e.pull_request.state == "closed")
        .count();

    PullRequestSummary {
        total: pull_requests.len(),
        open,
        closed,
        pull_requests,
    }
}

pub fn summarize_deployments(data: &[RepositoryData]) -> DeploymentSummary {
    let mut deployments: Vec<DeploymentEntry> = data
        .iter()
        .flat_map(|repo| {
            let repository = RepositoryRef::from(&repo.repository);
            repo.deployments.iter().map(move |d| DeploymentEntry {
                deployment: d.clone(),
                repository: repository.clone(),
            })
        })
        .collect();

    deployments.sort_by(|a, b| b.deployment.created_at.cmp(&a.deployment.created_at));

    let count = |state: &str| {
        deployments
            .iter()
            .filter(|e| e.deployment.state == state)
            .count()
    };

    DeploymentSummary {
        total: deployments.len(),
        success: count("success"),
        failure: count("failure"),
        pending: count("pending"),
        in_progress: count("in_progress"),
        deployments,
    }
}

/// Per-repository counts, most recently updated repository first.
pub fn summarize_repositories(data: Vec<RepositoryData>, recent_deployments: usize) -> RepositoryOverview {
    let mut repositories: Vec<RepositorySummary> = data
        .into_iter()
        .map(|repo| {
            let open_issues = repo.open_issues.iter().filter(|i| !i.is_pull_request()).count();
            let closed_issues = repo.closed_issues.iter().filter(|i| !i.is_pull_request()).count();

            RepositorySummary {
                issues: StateCounts::new(open_issues, closed_issues),
                pull_requests: StateCounts::new(
                    repo.open_pull_requests.len(),
                    repo.closed_pull_requests.len(),
                ),
                deployments: repo
                    .deployments
                    .into_iter()
                    .take(recent_deployments)
                    .map(|d| RecentDeployment {
                        environment: d.environment,
                        state: d.state,
                        created_at: d.created_at,
                    })
                    .collect(),
                repository: repo.repository,
            }
        })
        .collect();

    repositories.sort_by(|a, b| b.repository.updated_at.cmp(&a.repository.updated_at));

    RepositoryOverview {
        total: repositories.len(),
        repositories,
    }
}

/// Runs aggregations against a shared [`UpstreamApi`].
#[derive(Clone)]
pub struct AggregationEngine {
    api: Arc<dyn UpstreamApi>,
    settings: AggregationSettings,
}

impl AggregationEngine {
    pub fn new(api: Arc<dyn UpstreamApi>, settings: AggregationSettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    pub async fn issues(&self, token: &str) -> Result<IssueSummary, GitHubError> {
        let data = self.aggregate(token, Include::ISSUES).await?;
        Ok(summarize_issues(&data))
    }

    pub async fn pull_requests(&self, token: &str) -> Result<PullRequestSummary, GitHubError> {
        let data = self.aggregate(token, Include::PULL_REQUESTS).await?;
        Ok(summarize_pull_requests(&data))
    }

    pub async fn deployments(&self, token: &str) -> Result<DeploymentSummary, GitHubError> {
        let data = self.aggregate(token, Include::DEPLOYMENTS).await?;
        Ok(summarize_deployments(&data))
    }

    pub async fn repositories(&self, token: &str) -> Result<RepositoryOverview, GitHubError> {
        let data = self.aggregate(token, Include::ALL).await?;
        Ok(summarize_repositories(
            data,
            self.settings.deployment_status_lookups,
        ))
    }

    /// Fetch everything `include` asks for, one entry per repository in
    /// listing order.
    pub async fn aggregate(
        &self,
        token: &str,
        include: Include,
    ) -> Result<Vec<RepositoryData>, GitHubError> {
        let repositories = self.list_repositories(token).await?;
        tracing::debug!(
            repositories = repositories.len(),
            max_concurrency = self.settings.max_concurrency,
            "Aggregating repository data"
        );

        let limiter = Semaphore::new(self.settings.max_concurrency.max(1));
        let data = join_all(
            repositories
                .into_iter()
                .map(|repo| self.collect_repository(repo, include, &limiter, token)),
        )
        .await;

        Ok(data)
    }

    /// Repositories visible to the installation behind `token`.
    pub async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>, GitHubError> {
        let path = format!("/installation/repositories?per_page={}", self.settings.page_size);
        let body = self.api.get(&path, token).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list installation repositories");
            match e {
                GitHubError::UpstreamRequestFailed { .. } => e,
                other => GitHubError::UpstreamRequestFailed {
                    status: other.upstream_status().unwrap_or(502),
                },
            }
        })?;

        let listing: ListReposResponse = serde_json::from_value(body).map_err(|e| {
            tracing::error!(error = %e, "Unexpected repository listing payload");
            GitHubError::UpstreamRequestFailed { status: 502 }
        })?;

        Ok(listing.repositories)
    }

    async fn collect_repository(
        &self,
        repository: Repository,
        include: Include,
        limiter: &Semaphore,
        token: &str,
    ) -> RepositoryData {
        let full_name = repository.full_name.as_str();
        let page = self.settings.page_size;

        let issues = move |state: &'static str| {
            let path = format!("/repos/{}/issues?state={}&per_page={}", full_name, state, page);
            async move {
                if include.issues {
                    self.fetch_list::<Issue>(limiter, &path, token).await
                } else {
                    Vec::new()
                }
            }
        };
        let pulls = move |state: &'static str| {
            let path = format!("/repos/{}/pulls?state={}&per_page={}", full_name, state, page);
            async move {
                if include.pull_requests {
                    self.fetch_list::<PullRequest>(limiter, &path, token).await
                } else {
                    Vec::new()
                }
            }
        };
        let deployments = async {
            if include.deployments {
                self.collect_deployments(full_name, limiter, token).await
            } else {
                Vec::new()
            }
        };

        let (open_issues, closed_issues, open_pull_requests, closed_pull_requests, deployments) = futures::join!(
            issues("open"),
            issues("closed"),
            pulls("open"),
            pulls("closed"),
            deployments
        );

        RepositoryData {
            repository,
            open_issues,
            closed_issues,
            open_pull_requests,
            closed_pull_requests,
            deployments,
        }
    }

    async fn collect_deployments(
        &self,
        full_name: &str,
        limiter: &Semaphore,
        token: &str,
    ) -> Vec<DeploymentRecord> {
        let path = format!(
            "/repos/{}/deployments?per_page={}",
            full_name, self.settings.deployment_page_size
        );
        let deployments = self.fetch_list::<Deployment>(limiter, &path, token).await;
        let lookups = self.settings.deployment_status_lookups.min(deployments.len());

        let mut deployments = deployments.into_iter();
        let looked_up: Vec<Deployment> = deployments.by_ref().take(lookups).collect();

        let mut records = join_all(looked_up.into_iter().map(move |deployment| async move {
            let path = format!(
                "/repos/{}/deployments/{}/statuses?per_page=1",
                full_name, deployment.id
            );
            let state = self
                .fetch_list::<DeploymentStatus>(limiter, &path, token)
                .await
                .into_iter()
                .next()
                .map(|status| status.state);
            DeploymentRecord::new(deployment, state)
        }))
        .await;

        records.extend(deployments.map(|d| DeploymentRecord::new(d, None)));
        records
    }

    /// GET a JSON array under a permit. Any failure degrades to an empty list.
    async fn fetch_list<T: DeserializeOwned>(
        &self,
        limiter: &Semaphore,
        path: &str,
        token: &str,
    ) -> Vec<T> {
        let response = match limiter.acquire().await {
            Ok(_permit) => self.api.get(path, token).await,
            // The limiter is never closed
            Err(_) => return Vec::new(),
        };

        match response.and_then(|body| Ok(serde_json::from_value::<Vec<T>>(body)?)) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(path, error = %e, "Upstream fetch failed, using empty result");
                Vec::new()
            }
        }
    }
}
