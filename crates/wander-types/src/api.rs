use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Cookie channel --

/// Cookie carrying the current access token for server-side middleware.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Cookie carrying the access token expiry as unix seconds.
pub const TOKEN_EXPIRES_COOKIE: &str = "token_expires_at";

// -- Token refresh --

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Body returned by the auth provider's refresh endpoint.
///
/// Providers that rotate refresh tokens return a new one alongside the
/// access token; others omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

// -- Trip proxy --

/// Error body returned by the trip proxy routes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_id: Option<String>,
}

// -- Session --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub authenticated: bool,
    pub expires_at: DateTime<Utc>,
}
