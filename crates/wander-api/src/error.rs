use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use wander_types::api::ProxyErrorBody;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid trip id")]
    InvalidId(String),

    #[error("trip service is not configured")]
    NotConfigured,

    /// The upstream answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("trip service timed out")]
    Timeout,

    #[error("could not resolve trip service host")]
    Dns,

    #[error("could not connect to trip service")]
    Unavailable,

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::NotConfigured | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => *status,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Dns | Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> ProxyErrorBody {
        let (error, message, received_id) = match self {
            Self::InvalidId(id) => (
                "Invalid trip ID",
                "Trip ID must be a valid UUID v4".to_string(),
                Some(id.clone()),
            ),
            Self::NotConfigured => (
                "Server configuration error",
                "External API credentials are not configured".to_string(),
                None,
            ),
            Self::Upstream { message, .. } => ("Failed to fetch trip", message.clone(), None),
            Self::Timeout => (
                "Gateway timeout",
                "The trip service did not respond in time".to_string(),
                None,
            ),
            Self::Dns => (
                "Service unavailable",
                "Could not resolve the trip service host".to_string(),
                None,
            ),
            Self::Unavailable => (
                "Service unavailable",
                "Could not connect to the trip service".to_string(),
                None,
            ),
            Self::Internal(message) => ("Internal server error", message.clone(), None),
        };
        ProxyErrorBody {
            error: error.to_string(),
            message,
            received_id,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
