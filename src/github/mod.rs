//! GitHub integration module for GitHub App support.
//!
//! This module provides:
//! - App assertion (JWT) signing and installation token exchange with caching
//! - GitHub API client used for every upstream call
//! - Webhook signature verification and payload types
//! - Installation lifecycle handling driven by webhook events
//! - Fan-out aggregation of issues, pull requests and deployments

pub mod aggregation;
pub mod api_client;
pub mod error;
pub mod lifecycle;
pub mod token_manager;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregation::{AggregationEngine, AggregationSettings, Include};
pub use api_client::{
    Account, AccountType, GitHubClient, InstallationDetails, Repository, RepositorySelection,
    UpstreamApi,
};
pub use error::GitHubError;
pub use lifecycle::{InstallationLifecycleHandler, LifecycleError, LifecycleOutcome};
pub use token_manager::{AppJwtIssuer, InstallationAccessToken, InstallationTokenBroker};
pub use webhook::{InstallationWebhook, WebhookError};
