use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Minimum length for the session signing secret
const MIN_SESSION_SECRET_LENGTH: usize = 32;

/// Minimum length for the at-rest encryption key
const MIN_ENCRYPTION_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub github: GitHubAppConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection string, e.g. `sqlite://data/hubgate.db`
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

/// Settings shared with the external session provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// HS256 secret the session provider signs tenant tokens with
    #[serde(default)]
    pub secret: String,
    /// Public base URL of the web application; used as token issuer and redirect base
    #[serde(default)]
    pub url: String,
}

/// OAuth application used by the session provider for user sign-in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAppConfig {
    /// Numeric GitHub App ID
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// PEM private key used to sign app assertions
    #[serde(default)]
    pub private_key: String,
    /// Secret for verifying webhook signatures (HMAC-SHA256)
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for GitHubAppConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            private_key: String::new(),
            webhook_secret: String::new(),
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    "Hubgate-GitHub-Integration".to_string()
}

impl GitHubAppConfig {
    /// The app ID as a number. Only valid after [`Config::validate`] passed.
    pub fn numeric_app_id(&self) -> Option<u64> {
        self.app_id.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Identifies this service as the source of dispatched events
    #[serde(default)]
    pub event_key: String,
    /// Signs event envelopes so the worker only runs what ingress produced
    #[serde(default)]
    pub signing_key: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            event_key: String::new(),
            signing_key: String::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Maximum in-flight upstream calls per aggregation request
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Page size for repository, issue and pull request listings
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Page size for deployment listings
    #[serde(default = "default_deployment_page_size")]
    pub deployment_page_size: u32,
    /// How many of the most recent deployments get a status lookup
    #[serde(default = "default_deployment_status_lookups")]
    pub deployment_status_lookups: usize,
    /// Cached installation tokens are refreshed this many seconds before expiry
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            page_size: default_page_size(),
            deployment_page_size: default_deployment_page_size(),
            deployment_status_lookups: default_deployment_status_lookups(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}

fn default_page_size() -> u32 {
    100
}

fn default_deployment_page_size() -> u32 {
    10
}

fn default_deployment_status_lookups() -> usize {
    5
}

fn default_token_refresh_margin_secs() -> i64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file (if present), then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration file")?
        } else {
            info!("No config file found, using defaults and environment");
            Config::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Overlay secrets from the environment. `lookup` is injectable for tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 13] = [
            ("DATABASE_URL", &mut self.database.url),
            ("SESSION_SECRET", &mut self.session.secret),
            ("SESSION_URL", &mut self.session.url),
            ("GITHUB_CLIENT_ID", &mut self.oauth.client_id),
            ("GITHUB_CLIENT_SECRET", &mut self.oauth.client_secret),
            ("GITHUB_APP_ID", &mut self.github.app_id),
            ("GITHUB_APP_CLIENT_ID", &mut self.github.client_id),
            ("GITHUB_APP_CLIENT_SECRET", &mut self.github.client_secret),
            ("GITHUB_APP_PRIVATE_KEY", &mut self.github.private_key),
            ("GITHUB_WEBHOOK_SECRET", &mut self.github.webhook_secret),
            ("ENCRYPTION_KEY", &mut self.encryption.key),
            ("EVENT_KEY", &mut self.events.event_key),
            ("EVENT_SIGNING_KEY", &mut self.events.signing_key),
        ];

        for (name, slot) in overrides {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }

        // Keys passed through env files usually carry escaped newlines
        if self.github.private_key.contains("\\n") {
            self.github.private_key = self.github.private_key.replace("\\n", "\n");
        }
    }

    /// Check every required value; the service refuses to start on any failure.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.database.url.trim().is_empty() {
            problems.push("database.url is required".to_string());
        }
        if self.session.secret.len() < MIN_SESSION_SECRET_LENGTH {
            problems.push(format!(
                "session.secret must be at least {} characters",
                MIN_SESSION_SECRET_LENGTH
            ));
        }
        if !is_http_url(&self.session.url) {
            problems.push("session.url must be an absolute http(s) URL".to_string());
        }
        if self.oauth.client_id.trim().is_empty() {
            problems.push("oauth.client_id is required".to_string());
        }
        if self.oauth.client_secret.trim().is_empty() {
            problems.push("oauth.client_secret is required".to_string());
        }
        if self.github.numeric_app_id().is_none() {
            problems.push("github.app_id must be a numeric GitHub App ID".to_string());
        }
        if self.github.client_id.trim().is_empty() {
            problems.push("github.client_id is required".to_string());
        }
        if self.github.client_secret.trim().is_empty() {
            problems.push("github.client_secret is required".to_string());
        }
        if !self.github.private_key.contains("-----BEGIN") {
            problems.push("github.private_key must be a PEM encoded private key".to_string());
        }
        if self.github.webhook_secret.is_empty() {
            problems.push("github.webhook_secret is required".to_string());
        }
        if !is_http_url(&self.github.api_base_url) {
            problems.push("github.api_base_url must be an absolute http(s) URL".to_string());
        }
        if self.encryption.key.len() < MIN_ENCRYPTION_KEY_LENGTH {
            problems.push(format!(
                "encryption.key must be at least {} characters",
                MIN_ENCRYPTION_KEY_LENGTH
            ));
        }
        if self.events.event_key.trim().is_empty() {
            problems.push("events.event_key is required".to_string());
        }
        if self.events.signing_key.trim().is_empty() {
            problems.push("events.signing_key is required".to_string());
        }
        if self.events.queue_capacity == 0 {
            problems.push("events.queue_capacity must be at least 1".to_string());
        }
        if self.aggregation.max_concurrency == 0 {
            problems.push("aggregation.max_concurrency must be at least 1".to_string());
        }
        if self.aggregation.token_refresh_margin_secs < 0 {
            problems.push("aggregation.token_refresh_margin_secs must not be negative".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }
}

fn is_http_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();
    config.session.secret = "s".repeat(40);
    config.session.url = "https://app.example.com".to_string();
    config.oauth.client_id = "oauth-client".to_string();
    config.oauth.client_secret = "oauth-secret".to_string();
    config.github.app_id = "12345".to_string();
    config.github.client_id = "Iv1.abcdef".to_string();
    config.github.client_secret = "app-secret".to_string();
    config.github.private_key = include_str!("../github/testdata/app_key.pem").to_string();
    config.github.webhook_secret = "webhook-secret".to_string();
    config.encryption.key = "e".repeat(40);
    config.events.event_key = "hubgate-test".to_string();
    config.events.signing_key = "event-signing-key".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_default_config_fails_closed() {
        let err = Config::default().validate().unwrap_err().to_string();
        assert!(err.contains("database.url"));
        assert!(err.contains("session.secret"));
        assert!(err.contains("github.app_id"));
        assert!(err.contains("encryption.key"));
        assert!(err.contains("events.signing_key"));
    }

    #[test]
    fn test_short_encryption_key_rejected() {
        let mut config = test_config();
        config.encryption.key = "too-short".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("encryption.key must be at least 32 characters"));
    }

    #[test]
    fn test_non_numeric_app_id_rejected() {
        let mut config = test_config();
        config.github.app_id = "my-app".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_and_key_unescaping() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GITHUB_APP_ID", "999"),
            ("GITHUB_APP_PRIVATE_KEY", "-----BEGIN KEY-----\\nabc\\n-----END KEY-----"),
            ("DATABASE_URL", ""),
        ]);

        let mut config = test_config();
        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.github.app_id, "999");
        assert_eq!(config.github.private_key, "-----BEGIN KEY-----\nabc\n-----END KEY-----");
        // Empty values never clobber configured ones
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9090

[github]
app_id = "42"
webhook_secret = "whsec"

[aggregation]
max_concurrency = 3
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.github.numeric_app_id(), Some(42));
        assert_eq!(config.github.api_base_url, "https://api.github.com");
        assert_eq!(config.aggregation.max_concurrency, 3);
        assert_eq!(config.aggregation.deployment_status_lookups, 5);
    }
}
