//! Installation lifecycle driven by `installation` and
//! `installation_repositories` webhook events.
//!
//! An installation is active (row present, not suspended), suspended (row
//! present, `metadata.suspended`) or deleted (row absent). Every transition is
//! safe to replay: deliveries are at-least-once.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use super::token_manager::InstallationTokenBroker;
use super::webhook::InstallationWebhook;
use crate::db::{CredentialVault, MetadataFact, RepositoryChange, VaultError};

pub const INSTALLATION_EVENT: &str = "installation";
pub const INSTALLATION_REPOSITORIES_EVENT: &str = "installation_repositories";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("installation {0} not found")]
    InstallationNotFound(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// Grant facts recorded on the existing row.
    Activated,
    AlreadyActive,
    Deleted { removed: bool },
    Suspended { found: bool },
    Unsuspended { found: bool },
    RepositoriesUpdated { added: usize, removed: usize },
    /// Unknown event or action, or a `created` event that arrived before the
    /// installation callback wrote the row.
    Ignored,
}

pub struct InstallationLifecycleHandler {
    vault: CredentialVault,
    broker: Arc<InstallationTokenBroker>,
}

impl InstallationLifecycleHandler {
    pub fn new(vault: CredentialVault, broker: Arc<InstallationTokenBroker>) -> Self {
        Self { vault, broker }
    }

    pub async fn handle(
        &self,
        event: &str,
        payload: &InstallationWebhook,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        self.handle_at(event, payload, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        event: &str,
        payload: &InstallationWebhook,
        now: DateTime<Utc>,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let id = payload.installation.id.to_string();

        let outcome = match (event, payload.action.as_str()) {
            (INSTALLATION_EVENT, "created") => self.activate(&id, payload).await?,
            (INSTALLATION_EVENT, "deleted") => {
                self.broker.invalidate(&id);
                let removed = self.vault.delete(&id).await?;
                LifecycleOutcome::Deleted { removed }
            }
            (INSTALLATION_EVENT, "suspend") => {
                self.broker.invalidate(&id);
                let found = self.set_suspended(&id, true, now).await?;
                LifecycleOutcome::Suspended { found }
            }
            (INSTALLATION_EVENT, "unsuspend") => {
                let found = self.set_suspended(&id, false, now).await?;
                LifecycleOutcome::Unsuspended { found }
            }
            (INSTALLATION_REPOSITORIES_EVENT, action) => {
                self.record_repository_change(&id, action, payload, now)
                    .await?
            }
            _ => LifecycleOutcome::Ignored,
        };

        tracing::info!(
            installation_id = %id,
            event,
            action = %payload.action,
            outcome = ?outcome,
            "Processed installation event"
        );
        Ok(outcome)
    }

    async fn activate(
        &self,
        id: &str,
        payload: &InstallationWebhook,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let installation = &payload.installation;
        let grant = MetadataFact::Grant {
            account: installation.account.clone(),
            permissions: installation.permissions.clone(),
            events: installation.events.clone(),
            repository_selection: installation.repository_selection,
        };

        let mut changed = false;
        let row = self
            .vault
            .modify_metadata(id, |metadata| {
                changed = metadata.apply(grant);
                changed
            })
            .await?;

        Ok(match row {
            None => LifecycleOutcome::Ignored,
            Some(_) if changed => LifecycleOutcome::Activated,
            Some(_) => LifecycleOutcome::AlreadyActive,
        })
    }

    /// Returns whether the row exists. A missing row is not an error.
    async fn set_suspended(
        &self,
        id: &str,
        suspended: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let row = self
            .vault
            .modify_metadata(id, |metadata| {
                metadata.apply(MetadataFact::Suspension { suspended, at })
            })
            .await?;

        Ok(row.is_some())
    }

    async fn record_repository_change(
        &self,
        id: &str,
        action: &str,
        payload: &InstallationWebhook,
        at: DateTime<Utc>,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let change = RepositoryChange::new(
            action,
            payload.repositories_added.clone().unwrap_or_default(),
            payload.repositories_removed.clone().unwrap_or_default(),
            at,
        );
        let (added, removed) = (change.added_count, change.removed_count);

        self.vault
            .modify_metadata(id, |metadata| {
                metadata.apply(MetadataFact::RepositoryChange(change))
            })
            .await?
            .ok_or_else(|| LifecycleError::InstallationNotFound(id.to_string()))?;

        Ok(LifecycleOutcome::RepositoriesUpdated { added, removed })
    }
}
