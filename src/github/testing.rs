//! In-memory [`UpstreamApi`] for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::api_client::UpstreamApi;
use super::token_manager::AppJwtIssuer;
use super::GitHubError;

pub(crate) const TEST_PRIVATE_KEY: &str = include_str!("testdata/app_key.pem");
pub(crate) const TEST_PUBLIC_KEY: &str = include_str!("testdata/app_key.pub.pem");

pub(crate) fn test_issuer() -> AppJwtIssuer {
    AppJwtIssuer::new(12345, TEST_PRIVATE_KEY).unwrap()
}

#[derive(Clone)]
enum Canned {
    Json(Value),
    Status(u16),
}

/// Routes are keyed by `"<METHOD> <path>"` including the query string.
/// Unknown routes answer 404.
#[derive(Default)]
pub(crate) struct FakeUpstream {
    routes: Mutex<HashMap<String, Canned>>,
    deletes: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every GET/POST sleeps for `delay` while counted as in flight.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn on_get(&self, path: &str, body: Value) {
        self.insert("GET", path, Canned::Json(body));
    }

    pub fn on_get_status(&self, path: &str, status: u16) {
        self.insert("GET", path, Canned::Status(status));
    }

    pub fn on_post(&self, path: &str, body: Value) {
        self.insert("POST", path, Canned::Json(body));
    }

    pub fn on_post_status(&self, path: &str, status: u16) {
        self.insert("POST", path, Canned::Status(status));
    }

    pub fn on_delete(&self, path: &str, ok: bool) {
        self.deletes.lock().unwrap().insert(path.to_string(), ok);
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_token(&self, key: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, token)| token.clone())
    }

    /// Every token sent with `key`, oldest first.
    pub fn tokens(&self, key: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, token)| token.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn insert(&self, method: &str, path: &str, canned: Canned) {
        self.routes
            .lock()
            .unwrap()
            .insert(format!("{} {}", method, path), canned);
    }

    async fn respond(&self, method: &str, path: &str, token: &str) -> Result<Value, GitHubError> {
        let key = format!("{} {}", method, path);
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), token.to_string()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let canned = self.routes.lock().unwrap().get(&key).cloned();
        match canned {
            Some(Canned::Json(body)) => Ok(body),
            Some(Canned::Status(status)) => Err(GitHubError::UpstreamRequestFailed { status }),
            None => Err(GitHubError::UpstreamRequestFailed { status: 404 }),
        }
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn get(&self, path: &str, token: &str) -> Result<Value, GitHubError> {
        self.respond("GET", path, token).await
    }

    async fn post(&self, path: &str, _body: Option<&Value>, token: &str) -> Result<Value, GitHubError> {
        self.respond("POST", path, token).await
    }

    async fn delete(&self, path: &str, token: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push((format!("DELETE {}", path), token.to_string()));
        self.deletes
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(false)
    }
}
