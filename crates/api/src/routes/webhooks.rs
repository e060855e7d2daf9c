//! Stripe webhook endpoint

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::error::ApiError;
use crate::state::AppState;

/// Handle Stripe webhook events.
///
/// 400 means the delivery itself is bad (missing or invalid signature) and
/// redelivery cannot help; any handler failure maps to 500 so Stripe
/// redelivers the event.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .engine
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    state.engine.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling failed");
        ApiError::Internal(e.to_string())
    })?;

    Ok(StatusCode::OK)
}
