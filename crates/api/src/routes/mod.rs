//! HTTP routes

mod reconciliation;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/admin/reconciliation", get(reconciliation::scan))
        .route(
            "/admin/reconciliation/reconcile",
            post(reconciliation::reconcile),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
