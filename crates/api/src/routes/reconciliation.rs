//! Operator reconciliation endpoints

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tuition_billing::{ReconciliationItem, ScanReport, SyncOutcome};

use crate::error::ApiError;
use crate::state::AppState;

/// Run a reconciliation scan and return the worklist
pub async fn scan(State(state): State<AppState>) -> Result<Json<ScanReport>, ApiError> {
    let report = state.engine.scanner.scan().await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub subscription_id: String,
    pub outcome: String,
    pub subscriptions_synced: usize,
    pub subscriptions_canceled: usize,
}

/// Apply one worklist item: link the candidate student and sync the customer
pub async fn reconcile(
    State(state): State<AppState>,
    Json(item): Json<ReconciliationItem>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let outcome = state.engine.scanner.reconcile(&item).await?;

    let response = match outcome {
        SyncOutcome::Completed {
            subscriptions_synced,
            subscriptions_canceled,
            ..
        } => ReconcileResponse {
            subscription_id: item.subscription_id,
            outcome: "completed".to_string(),
            subscriptions_synced,
            subscriptions_canceled,
        },
        SyncOutcome::SourceGone { customer_id } => {
            tracing::warn!(
                customer_id = %customer_id,
                "Reconcile target customer deleted at provider"
            );
            ReconcileResponse {
                subscription_id: item.subscription_id,
                outcome: "source_gone".to_string(),
                subscriptions_synced: 0,
                subscriptions_canceled: 0,
            }
        }
    };

    Ok(Json(response))
}
