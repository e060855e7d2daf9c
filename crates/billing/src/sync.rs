//! Subscription state synchronizer
//!
//! The convergence point of the engine: given a Stripe customer id, fetch the
//! canonical list of that customer's subscriptions and make the internal
//! `subscriptions` and `students` rows match it, inside one transaction.
//!
//! The sync fully overwrites instead of patching, so re-running it against
//! unchanged provider state produces identical rows, and two interleaved
//! syncs for the same customer race to the same final state. Provider errors
//! abort before the transaction opens (or roll it back); the webhook caller
//! propagates the failure so Stripe redelivers.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::metadata::covered_student_ids;
use crate::models::{EnrollmentStatus, SubscriptionStatus};

/// Result of one sync pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed {
        payer_id: Uuid,
        subscriptions_synced: usize,
        subscriptions_canceled: usize,
    },
    /// The external customer is deleted at the provider and we hold no payer
    /// for it; nothing to converge toward. Non-fatal.
    SourceGone { customer_id: String },
}

pub struct SubscriptionSynchronizer {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionSynchronizer {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Overwrite internal billing state from freshly-fetched provider state.
    pub async fn sync(&self, customer_id: &str) -> BillingResult<SyncOutcome> {
        let payer_id = match self.find_or_create_payer(customer_id).await? {
            Some(id) => id,
            None => {
                tracing::info!(
                    customer_id = %customer_id,
                    "Stripe customer deleted and no internal payer exists, skipping sync"
                );
                return Ok(SyncOutcome::SourceGone {
                    customer_id: customer_id.to_string(),
                });
            }
        };

        // All provider reads happen before the transaction opens
        let subscriptions = self.stripe.list_customer_subscriptions(customer_id).await?;
        let fetched_ids: Vec<String> = subscriptions
            .iter()
            .map(|s| s.id.as_str().to_string())
            .collect();

        let grace_days = self.stripe.config().grace_period_days;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.pool.begin().await?;

        for subscription in &subscriptions {
            let status = SubscriptionStatus::from_stripe(subscription.status);

            let period_start =
                OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
                    .unwrap_or(now);
            let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .unwrap_or(now);

            // Grace window only ever exists while past due
            let grace_period_end = match status {
                SubscriptionStatus::PastDue => Some(now + Duration::days(grace_days)),
                _ => None,
            };

            sqlx::query(
                r#"
                INSERT INTO subscriptions (
                    id, stripe_subscription_id, payer_id, status,
                    current_period_start, current_period_end,
                    next_payment_date, grace_period_end, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
                ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                    payer_id = EXCLUDED.payer_id,
                    status = EXCLUDED.status,
                    current_period_start = EXCLUDED.current_period_start,
                    current_period_end = EXCLUDED.current_period_end,
                    next_payment_date = EXCLUDED.next_payment_date,
                    grace_period_end = EXCLUDED.grace_period_end,
                    updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription.id.as_str())
            .bind(payer_id)
            .bind(status.as_str())
            .bind(period_start)
            .bind(period_end)
            .bind(period_end) // next payment is due at period end
            .bind(grace_period_end)
            .execute(&mut *tx)
            .await?;

            let student_ids = covered_student_ids(&subscription.metadata);
            if student_ids.is_empty() {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    "Subscription metadata names no students"
                );
                continue;
            }

            let enrollment = if status == SubscriptionStatus::Active {
                EnrollmentStatus::Enrolled
            } else {
                EnrollmentStatus::Registered
            };

            sqlx::query(
                r#"
                UPDATE students SET
                    payer_id = $1,
                    stripe_subscription_id = $2,
                    subscription_status = $3,
                    enrollment_status = $4,
                    next_payment_due = $5,
                    updated_at = NOW()
                WHERE id = ANY($6)
                "#,
            )
            .bind(payer_id)
            .bind(subscription.id.as_str())
            .bind(status.as_str())
            .bind(enrollment.as_str())
            .bind(period_end)
            .bind(&student_ids)
            .execute(&mut *tx)
            .await?;
        }

        // Any internal row for this payer absent from the fetched set is no
        // longer enumerable at the provider: mark it canceled, never delete.
        let orphaned: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_subscription_id FROM subscriptions
            WHERE payer_id = $1
              AND status != 'canceled'
              AND NOT (stripe_subscription_id = ANY($2))
            "#,
        )
        .bind(payer_id)
        .bind(&fetched_ids)
        .fetch_all(&mut *tx)
        .await?;

        let orphaned_ids: Vec<String> = orphaned.into_iter().map(|(id,)| id).collect();
        if !orphaned_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', grace_period_end = NULL, updated_at = NOW()
                WHERE stripe_subscription_id = ANY($1)
                "#,
            )
            .bind(&orphaned_ids)
            .execute(&mut *tx)
            .await?;

            // No student may stay enrolled against a canceled subscription
            sqlx::query(
                r#"
                UPDATE students
                SET subscription_status = 'canceled',
                    enrollment_status = 'registered',
                    updated_at = NOW()
                WHERE stripe_subscription_id = ANY($1)
                "#,
            )
            .bind(&orphaned_ids)
            .execute(&mut *tx)
            .await?;

            tracing::info!(
                payer_id = %payer_id,
                canceled = orphaned_ids.len(),
                "Marked subscriptions missing from provider list as canceled"
            );
        }

        tx.commit().await?;

        tracing::info!(
            customer_id = %customer_id,
            payer_id = %payer_id,
            synced = subscriptions.len(),
            canceled = orphaned_ids.len(),
            "Subscription sync complete"
        );

        Ok(SyncOutcome::Completed {
            payer_id,
            subscriptions_synced: subscriptions.len(),
            subscriptions_canceled: orphaned_ids.len(),
        })
    }

    /// Locate the internal payer for a Stripe customer, adopting or creating
    /// one if needed.
    ///
    /// Lookup order: stored customer id, then the provider customer's email
    /// (so a re-created Stripe customer for the same human adopts the
    /// existing payer instead of spawning a duplicate). Returns `None` when
    /// a payer would have to be created but the customer is deleted at the
    /// provider.
    async fn find_or_create_payer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM payers WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((id,)) = existing {
            return Ok(Some(id));
        }

        let customer = self.stripe.retrieve_customer(customer_id).await?;
        if customer.deleted {
            return Ok(None);
        }

        let email = customer.email.clone().ok_or_else(|| {
            BillingError::InvalidPayload(format!("customer {} has no email", customer_id))
        })?;

        // Same human, new Stripe customer: adopt the payer we already have
        let by_email: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM payers WHERE LOWER(email) = LOWER($1)")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((id,)) = by_email {
            sqlx::query(
                "UPDATE payers SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(customer_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

            tracing::info!(
                payer_id = %id,
                customer_id = %customer_id,
                "Adopted existing payer for re-created Stripe customer"
            );
            return Ok(Some(id));
        }

        let id = Uuid::new_v4();
        let name = customer
            .name
            .clone()
            .unwrap_or_else(|| email.split('@').next().unwrap_or(&email).to_string());

        sqlx::query(
            r#"
            INSERT INTO payers (id, name, email, phone, stripe_customer_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&name)
        .bind(&email)
        .bind(customer.phone.as_ref())
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            payer_id = %id,
            customer_id = %customer_id,
            "Created payer for new Stripe customer"
        );
        Ok(Some(id))
    }
}
