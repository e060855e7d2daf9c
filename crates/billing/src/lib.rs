// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tuition billing reconciliation engine
//!
//! Keeps internal enrollment and payment state converged with Stripe, which
//! is the source of truth for money movement.
//!
//! ## Components
//!
//! - **Webhook Event Router**: verifies and dispatches the Stripe events the
//!   engine reacts to
//! - **Idempotency Tracker**: TTL'd processed-event records so at-least-once
//!   delivery applies each event once
//! - **Identity Resolver**: maps external billing identities to at most one
//!   internal student or payer, never guessing on ambiguity
//! - **Subscription State Synchronizer**: overwrite-based convergence of
//!   internal subscription and student rows
//! - **Payment Ledger Writer**: append-only per-student payment rows
//! - **Reconciliation Scanner**: read-only drift detection with an explicit
//!   operator repair action

pub mod client;
pub mod error;
pub mod idempotency;
pub mod identity;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod payout;
pub mod reconcile;
pub mod sync;
pub mod webhooks;

pub use client::{StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use idempotency::{
    IdempotencyStore, InMemoryIdempotencyStore, ProcessedEvent, RedisIdempotencyStore,
};
pub use identity::{ExternalIdentity, IdentityResolver, MatchedParty, Resolution};
pub use ledger::{split_amount, PaymentLedgerWriter};
pub use models::{EnrollmentStatus, SubscriptionStatus};
pub use payout::{PayoutBreakdown, PayoutReporter};
pub use reconcile::{
    AmbiguousMatch, CheckoutHints, CustomerDetail, ReconciliationItem, ReconciliationScanner,
    ScanError, ScanReport,
};
pub use sync::{SubscriptionSynchronizer, SyncOutcome};
pub use webhooks::WebhookRouter;

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// The engine's components over one shared client, pool, and event store
pub struct ReconciliationEngine {
    pub webhooks: WebhookRouter,
    pub resolver: IdentityResolver,
    pub ledger: PaymentLedgerWriter,
    pub synchronizer: SubscriptionSynchronizer,
    pub scanner: ReconciliationScanner,
    pub payouts: PayoutReporter,
}

impl ReconciliationEngine {
    /// Build the engine from environment variables, connecting the Redis
    /// processed-event store.
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| BillingError::MissingConfig("REDIS_URL"))?;

        let ttl = Duration::from_secs(stripe.config().idempotency_ttl_days * 24 * 60 * 60);
        let store = RedisIdempotencyStore::connect(&redis_url, ttl).await?;

        Ok(Self::new(stripe, pool, Arc::new(store)))
    }

    /// Build the engine with an explicit client and event store. Tests pass
    /// an [`InMemoryIdempotencyStore`] here.
    pub fn new(stripe: StripeClient, pool: PgPool, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            webhooks: WebhookRouter::new(stripe.clone(), pool.clone(), store),
            resolver: IdentityResolver::new(pool.clone()),
            ledger: PaymentLedgerWriter::new(pool.clone()),
            synchronizer: SubscriptionSynchronizer::new(stripe.clone(), pool.clone()),
            scanner: ReconciliationScanner::new(stripe.clone(), pool),
            payouts: PayoutReporter::new(stripe),
        }
    }
}
