//! Error types for the reconciliation engine

use thiserror::Error;

/// Errors produced by the billing reconciliation engine
#[derive(Debug, Error)]
pub enum BillingError {
    /// Transient provider failure. The current operation aborts without a
    /// partial commit; Stripe webhook redelivery (or a scanner re-run) retries.
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("database error: {0}")]
    Database(String),

    /// The idempotency store could not be reached. The router treats this as
    /// "not yet processed" and re-runs the (idempotent) handler.
    #[error("idempotency store error: {0}")]
    IdempotencyStore(String),

    /// Malformed or unexpected event payload. Logged and dropped, never retried.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// More than one internal record matched the external identity. Escalated
    /// to manual review; the engine never picks a winner.
    #[error("ambiguous identity at stage {stage}: {candidates} candidates")]
    AmbiguousIdentity { stage: String, candidates: usize },

    /// The external customer has been deleted at the provider.
    #[error("Stripe customer {0} is deleted")]
    CustomerGone(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Missing required configuration, raised at the call site that needs it.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(e: redis::RedisError) -> Self {
        BillingError::IdempotencyStore(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
