use thiserror::Error;

/// Failures talking to the GitHub REST API or producing credentials for it.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("failed to sign app assertion: {0}")]
    SigningFailed(String),

    #[error("installation token exchange rejected with status {status}")]
    UpstreamAuthFailed { status: u16 },

    #[error("upstream request failed with status {status}")]
    UpstreamRequestFailed { status: u16 },

    #[error("upstream request could not be sent: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected upstream response: {0}")]
    InvalidResponse(String),
}

impl GitHubError {
    /// The upstream HTTP status, when the failure carried one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            GitHubError::UpstreamAuthFailed { status }
            | GitHubError::UpstreamRequestFailed { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GitHubError {
    fn from(err: serde_json::Error) -> Self {
        GitHubError::InvalidResponse(err.to_string())
    }
}
