//! In-process event bus between webhook ingress and the lifecycle handler.
//!
//! Verified webhooks are wrapped in a signed [`EventEnvelope`] and queued on a
//! bounded channel. [`LifecycleWorker`] drains the queue one envelope at a
//! time, so deliveries for the same installation are applied in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::EventsConfig;
use crate::github::webhook::{self, InstallationWebhook};
use crate::github::{InstallationLifecycleHandler, LifecycleOutcome};

/// Prefix of every event name produced from a GitHub webhook.
pub const GITHUB_EVENT_PREFIX: &str = "github/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event queue is closed")]
    QueueClosed,
    #[error("event payload could not be encoded: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    /// `github/<X-GitHub-Event>`
    pub name: String,
    /// Configured event key of the publishing service.
    pub source: String,
    #[serde(default)]
    pub delivery: Option<String>,
    pub payload: Value,
    /// `sha256=<hex>` HMAC over [`EventEnvelope::signing_input`].
    pub signature: String,
}

impl EventEnvelope {
    fn signing_input(id: &str, name: &str, source: &str, payload: &Value) -> Result<Vec<u8>, EventError> {
        let payload = serde_json::to_string(payload).map_err(|e| EventError::Encoding(e.to_string()))?;
        Ok(format!("{}\n{}\n{}\n{}", id, name, source, payload).into_bytes())
    }

    pub fn signed(
        name: &str,
        source: &str,
        delivery: Option<String>,
        payload: Value,
        signing_key: &str,
    ) -> Result<Self, EventError> {
        let id = uuid::Uuid::new_v4().to_string();
        let input = Self::signing_input(&id, name, source, &payload)?;

        Ok(Self {
            signature: webhook::sign(signing_key, &input),
            id,
            name: name.to_string(),
            source: source.to_string(),
            delivery,
            payload,
        })
    }

    pub fn verify(&self, source: &str, signing_key: &str) -> bool {
        if self.source != source {
            return false;
        }
        match Self::signing_input(&self.id, &self.name, &self.source, &self.payload) {
            Ok(input) => webhook::verify(&input, &self.signature, signing_key),
            Err(_) => false,
        }
    }

    /// The GitHub event type, if this envelope carries a webhook.
    pub fn github_event(&self) -> Option<&str> {
        self.name.strip_prefix(GITHUB_EVENT_PREFIX)
    }
}

/// Signs and queues envelopes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<EventEnvelope>,
    source: String,
    signing_key: String,
}

impl EventPublisher {
    pub fn channel(config: &EventsConfig) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let publisher = Self {
            tx,
            source: config.event_key.clone(),
            signing_key: config.signing_key.clone(),
        };
        (publisher, rx)
    }

    /// Queue a verified webhook. Waits for room when the queue is full.
    pub async fn publish_webhook(
        &self,
        event: &str,
        delivery: Option<String>,
        payload: Value,
    ) -> Result<String, EventError> {
        let envelope = EventEnvelope::signed(
            &format!("{}{}", GITHUB_EVENT_PREFIX, event),
            &self.source,
            delivery,
            payload,
            &self.signing_key,
        )?;
        let id = envelope.id.clone();

        self.tx
            .send(envelope)
            .await
            .map_err(|_| EventError::QueueClosed)?;

        tracing::debug!(event_id = %id, event, "Queued webhook event");
        Ok(id)
    }
}

/// Applies queued installation events.
pub struct LifecycleWorker {
    rx: mpsc::Receiver<EventEnvelope>,
    handler: Arc<InstallationLifecycleHandler>,
    source: String,
    signing_key: String,
}

impl LifecycleWorker {
    pub fn new(
        rx: mpsc::Receiver<EventEnvelope>,
        handler: Arc<InstallationLifecycleHandler>,
        config: &EventsConfig,
    ) -> Self {
        Self {
            rx,
            handler,
            source: config.event_key.clone(),
            signing_key: config.signing_key.clone(),
        }
    }

    /// Runs until every publisher is dropped.
    pub async fn run(mut self) {
        tracing::info!("Lifecycle worker started");

        while let Some(envelope) = self.rx.recv().await {
            self.process(envelope).await;
        }

        tracing::info!("Lifecycle worker stopped");
    }

    pub async fn process(&self, envelope: EventEnvelope) -> Option<LifecycleOutcome> {
        if !envelope.verify(&self.source, &self.signing_key) {
            tracing::warn!(event_id = %envelope.id, name = %envelope.name, "Rejected event with invalid signature");
            return None;
        }

        let Some(event) = envelope.github_event() else {
            tracing::debug!(event_id = %envelope.id, name = %envelope.name, "Ignoring non-GitHub event");
            return None;
        };

        let payload: InstallationWebhook = match serde_json::from_value(envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                // Other webhook types carry no installation object
                tracing::debug!(event_id = %envelope.id, event, error = %e, "Ignoring event without installation payload");
                return Some(LifecycleOutcome::Ignored);
            }
        };

        match self.handler.handle(event, &payload).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    delivery = ?envelope.delivery,
                    event,
                    installation_id = payload.installation.id,
                    error = %e,
                    "Failed to process installation event"
                );
                None
            }
        }
    }
}
