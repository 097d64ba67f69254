use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use wander_types::api::{ACCESS_TOKEN_COOKIE, TOKEN_EXPIRES_COOKIE};

/// The caller's credential as carried by the session cookies.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Reject requests without a live session cookie pair.
pub async fn require_session(jar: CookieJar, mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let access_token = jar
        .get(ACCESS_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let expires_at = jar
        .get(TOKEN_EXPIRES_COOKIE)
        .and_then(|c| c.value().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if expires_at <= Utc::now() {
        debug!(%expires_at, "Rejected expired session cookie");
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(Session {
        access_token,
        expires_at,
    });
    Ok(next.run(req).await)
}
