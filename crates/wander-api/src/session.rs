use axum::{Extension, Json};

use wander_types::api::SessionResponse;

use crate::middleware::Session;

/// GET /api/v1/session
pub async fn get_session(Extension(session): Extension<Session>) -> Json<SessionResponse> {
    Json(SessionResponse {
        authenticated: true,
        expires_at: session.expires_at,
    })
}
