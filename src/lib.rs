pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod events;
pub mod github;

pub use db::DbPool;

use anyhow::{Context, Result};
use config::Config;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::CredentialCipher;
use crate::db::CredentialVault;
use crate::events::{EventEnvelope, EventPublisher, LifecycleWorker};
use crate::github::{
    AggregationEngine, AggregationSettings, AppJwtIssuer, InstallationLifecycleHandler,
    InstallationTokenBroker, UpstreamApi,
};

/// Shared components, constructed once at startup.
pub struct AppState {
    pub config: Config,
    pub vault: CredentialVault,
    pub cipher: CredentialCipher,
    pub broker: Arc<InstallationTokenBroker>,
    pub engine: AggregationEngine,
    pub events: EventPublisher,
}

impl AppState {
    /// `api` is the single upstream client shared by the broker and the engine.
    pub fn new(
        config: Config,
        db: DbPool,
        api: Arc<dyn UpstreamApi>,
        events: EventPublisher,
    ) -> Result<Self> {
        let app_id = config
            .github
            .numeric_app_id()
            .context("github.app_id must be numeric")?;
        let issuer = AppJwtIssuer::new(app_id, &config.github.private_key)
            .context("Failed to load GitHub App private key")?;

        let broker = Arc::new(InstallationTokenBroker::new(
            issuer,
            api.clone(),
            chrono::Duration::seconds(config.aggregation.token_refresh_margin_secs),
        ));
        let engine = AggregationEngine::new(api, AggregationSettings::from(&config.aggregation));
        let cipher = CredentialCipher::new(&config.encryption.key);

        Ok(Self {
            vault: CredentialVault::new(db),
            cipher,
            broker,
            engine,
            events,
            config,
        })
    }

    /// Handler for the lifecycle worker, sharing this state's vault and token cache.
    pub fn lifecycle_handler(&self) -> InstallationLifecycleHandler {
        InstallationLifecycleHandler::new(self.vault.clone(), self.broker.clone())
    }

    /// Spawn the worker that applies queued installation events.
    ///
    /// The worker exits once the queue is drained and every publisher is
    /// gone, i.e. after the last clone of this state has been dropped.
    pub fn spawn_lifecycle_worker(&self, rx: mpsc::Receiver<EventEnvelope>) -> JoinHandle<()> {
        let handler = Arc::new(self.lifecycle_handler());
        let worker = LifecycleWorker::new(rx, handler, &self.config.events);
        tokio::spawn(worker.run())
    }
}
