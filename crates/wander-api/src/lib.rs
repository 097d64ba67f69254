//! HTTP surface of the Wander server: the trip proxy and the cookie session
//! check.

pub mod error;
pub mod middleware;
pub mod session;
pub mod state;
pub mod trips;

use axum::{Json, Router, middleware::from_fn, routing::get};
use serde_json::{Value, json};

use crate::middleware::require_session;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/v1/usertrips/{id}", get(trips::get_trip))
        .with_state(state);

    let protected_routes = Router::new()
        .route("/api/v1/session", get(session::get_session))
        .layer(from_fn(require_session));

    Router::new().merge(public_routes).merge(protected_routes)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
