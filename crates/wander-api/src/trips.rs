use std::error::Error as _;
use std::sync::LazyLock;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use regex::Regex;
use tracing::{debug, error, warn};

use crate::error::ProxyError;
use crate::state::AppState;

/// Trip details change rarely; let the CDN serve them for ten minutes and
/// revalidate in the background for twenty more.
pub const TRIP_CACHE_CONTROL: &str = "public, s-maxage=600, stale-while-revalidate=1200";

static UUID_V4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$").unwrap()
});

pub fn is_uuid_v4(id: &str) -> bool {
    UUID_V4.is_match(id)
}

/// GET /api/v1/usertrips/{id}
pub async fn get_trip(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProxyError> {
    if !is_uuid_v4(&id) {
        debug!(received_id = %id, "Rejected malformed trip id");
        return Err(ProxyError::InvalidId(id));
    }

    let (Some(base_url), Some(token)) = (&state.upstream.base_url, &state.upstream.token) else {
        error!("EXTERNAL_API_URL or EXTERNAL_API_TOKEN is not set");
        return Err(ProxyError::NotConfigured);
    };

    let url = format!("{}/api/v1/usertrips/{}", base_url.trim_end_matches('/'), id);
    let response = fetch_with_retry(&state, &url, token).await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = upstream_message(&text)
            .unwrap_or_else(|| format!("Trip service responded with {status}"));
        warn!(trip_id = %id, %status, "Upstream rejected trip lookup: {}", message);
        return Err(ProxyError::Upstream { status, message });
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("application/json"));
    let body = response.bytes().await.map_err(|e| classify(&e))?;

    debug!(trip_id = %id, bytes = body.len(), "Trip fetched");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static(TRIP_CACHE_CONTROL)),
        ],
        body,
    )
        .into_response())
}

/// Send the lookup, retrying network failures with a fixed backoff. Any
/// response, whatever its status, ends the loop.
async fn fetch_with_retry(
    state: &AppState,
    url: &str,
    token: &str,
) -> Result<reqwest::Response, ProxyError> {
    let upstream = &state.upstream;
    let mut attempt = 0;

    loop {
        let result = state
            .http
            .get(url)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .timeout(upstream.timeout)
            .send()
            .await;

        let err = match result {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let failure = classify(&err);
        if is_retryable(&failure) && attempt < upstream.max_retries {
            attempt += 1;
            warn!(
                attempt,
                max_retries = upstream.max_retries,
                "Trip service request failed ({}), retrying in {:?}",
                failure,
                upstream.backoff
            );
            tokio::time::sleep(upstream.backoff).await;
            continue;
        }

        error!(attempts = attempt + 1, "Trip service request failed: {}", err);
        return Err(failure);
    }
}

fn classify(err: &reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout
    } else if is_dns_failure(err) {
        ProxyError::Dns
    } else if err.is_connect() {
        ProxyError::Unavailable
    } else {
        ProxyError::Internal(format!("trip service request failed: {err}"))
    }
}

fn is_retryable(failure: &ProxyError) -> bool {
    matches!(failure, ProxyError::Timeout | ProxyError::Dns | ProxyError::Unavailable)
}

/// Resolution failures surface as connect errors; only the source chain tells
/// them apart from a refused connection.
fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("lookup address") {
            return true;
        }
        source = cause.source();
    }
    false
}

fn upstream_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("message")?.as_str().map(str::to_string)
}
