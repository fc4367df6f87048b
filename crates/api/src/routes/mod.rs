//! Route definitions

mod billing;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Public: no token exists yet when the catalog is browsed, and the
    // provider signs webhook deliveries instead of carrying a bearer token.
    let public = Router::new()
        .route("/health", get(health))
        .route("/billing/plans", get(billing::list_plans))
        .route("/billing/webhook", post(billing::webhook));

    let authenticated = Router::new()
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/cancel", post(billing::cancel))
        .layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
