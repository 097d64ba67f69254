use reqwest::StatusCode;
use thiserror::Error;

/// Failures writing or reading credentials.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("{channel} channel write failed: {source}")]
    Channel {
        channel: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of a failed refresh. Cloned to every waiter of the same refresh.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("refresh endpoint rejected the refresh token with status {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("failed to persist refreshed token: {0}")]
    Storage(String),

    #[error("refresh task ended without an outcome")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Authorization could not be recovered; credentials have been cleared and
    /// the caller should send the user to sign in.
    #[error("session expired")]
    SessionExpired,

    #[error("HTTP {status}: {status_text}")]
    Http {
        status: StatusCode,
        status_text: String,
        body: Option<serde_json::Value>,
    },

    /// No response was received at all.
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

/// Failures of the local saved-items cache and conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
