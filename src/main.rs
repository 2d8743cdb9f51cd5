use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hubgate::config::Config;
use hubgate::db::Provider;
use hubgate::events::EventPublisher;
use hubgate::github::{GitHubClient, UpstreamApi};
use hubgate::AppState;

#[derive(Parser, Debug)]
#[command(name = "hubgate")]
#[command(author, version, about = "GitHub App credential broker and dashboard aggregator", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hubgate.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Hubgate v{}", env!("CARGO_PKG_VERSION"));

    // Refuse to start with incomplete configuration
    config.validate()?;

    // Initialize database
    let db = hubgate::db::init(&config.database).await?;

    // One upstream client for token exchange and aggregation
    let api: Arc<dyn UpstreamApi> = Arc::new(
        GitHubClient::new(&config.github.api_base_url, &config.github.user_agent)
            .context("Failed to build GitHub client")?,
    );

    // Create event channel
    let (events, events_rx) = EventPublisher::channel(&config.events);

    // Create app state
    let state = Arc::new(AppState::new(config.clone(), db, api, events)?);

    match state.vault.find_latest_by_provider(Provider::GitHub).await {
        Ok(Some(latest)) => tracing::info!(
            installation_id = %latest.id,
            organization_id = %latest.organization_id,
            "Most recent GitHub installation"
        ),
        Ok(None) => tracing::info!("No GitHub installations connected yet"),
        Err(e) => tracing::warn!(error = %e, "Failed to read stored installations"),
    }

    // Start lifecycle worker
    let worker = state.spawn_lifecycle_worker(events_rx);

    // Create API router
    let app = hubgate::api::create_router(state.clone());

    // Start API server
    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;

    tracing::info!("API server listening on http://{}", api_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Acknowledged deliveries are still queued; dropping the last publisher
    // lets the worker finish them and exit
    drop(state);
    tracing::info!("Draining queued installation events");
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Lifecycle worker terminated abnormally");
    }

    served?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
