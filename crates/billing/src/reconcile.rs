//! Reconciliation scanner
//!
//! Read-only drift detection between the provider's active subscriptions and
//! internal billing state. The scanner pages through every externally-active
//! subscription and emits a worklist of entries an operator should look at;
//! it never writes. Applying a fix is the separate, explicit
//! [`ReconciliationScanner::reconcile`] call.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::identity::{ExternalIdentity, IdentityResolver, MatchedParty, Resolution};
use crate::models::SubscriptionStatus;
use crate::sync::{SubscriptionSynchronizer, SyncOutcome};
use crate::webhooks::custom_field_text;

/// Provider-side customer detail carried on each worklist entry so an
/// operator can link manually without opening the Stripe dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDetail {
    pub customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Student name/phone the payer typed into checkout custom fields, fetched
/// lazily only for subscriptions that need resolution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutHints {
    pub student_name: Option<String>,
    pub student_phone: Option<String>,
}

/// Several internal records matched at one cascade stage. The operator picks
/// the right one; the engine never does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub stage: String,
    pub candidates: Vec<MatchedParty>,
}

/// One divergent subscription in the worklist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub subscription_id: String,
    pub subscription_status: String,
    pub customer: CustomerDetail,
    /// Internal state disagrees with the provider
    pub needs_reconciliation: bool,
    /// No internal record could be resolved at all
    pub is_unmatched: bool,
    /// The resolver's single chosen match, when it found exactly one
    pub candidate: Option<MatchedParty>,
    /// Set when the resolver found several candidates instead of one
    pub ambiguity: Option<AmbiguousMatch>,
    pub hints: CheckoutHints,
}

/// A per-subscription failure during the scan. Collected, not swallowed, so
/// the caller can tell "no divergences" apart from "errors hid divergences".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanError {
    pub subscription_id: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub items: Vec<ReconciliationItem>,
    pub errors: Vec<ScanError>,
}

pub struct ReconciliationScanner {
    stripe: StripeClient,
    pool: PgPool,
}

impl ReconciliationScanner {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Page through every externally-active subscription and build the
    /// worklist. Holds no transaction across the scan.
    pub async fn scan(&self) -> BillingResult<ScanReport> {
        let mut report = ScanReport::default();
        let mut starting_after: Option<stripe::SubscriptionId> = None;

        loop {
            let page = self
                .stripe
                .list_active_subscriptions_page(starting_after.clone(), 100)
                .await?;

            for subscription in &page.data {
                report.scanned += 1;
                match self.inspect_subscription(subscription).await {
                    Ok(Some(item)) => report.items.push(item),
                    Ok(None) => {}
                    Err(e) => report.errors.push(ScanError {
                        subscription_id: subscription.id.to_string(),
                        message: e.to_string(),
                    }),
                }
            }

            if !page.has_more {
                break;
            }
            starting_after = page.data.last().map(|s| s.id.clone());
            if starting_after.is_none() {
                break;
            }
        }

        tracing::info!(
            scanned = report.scanned,
            divergent = report.items.len(),
            errors = report.errors.len(),
            "Reconciliation scan complete"
        );
        Ok(report)
    }

    /// Compare one provider subscription against internal state.
    ///
    /// Returns `None` for entries that need no operator attention: already
    /// correctly linked with matching status, or internally marked canceled
    /// (an operator already decided about those).
    async fn inspect_subscription(
        &self,
        subscription: &stripe::Subscription,
    ) -> BillingResult<Option<ReconciliationItem>> {
        let subscription_id = subscription.id.to_string();
        let fetched_status = SubscriptionStatus::from_stripe(subscription.status);

        let internal_status: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(&subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((status,)) = &internal_status {
            if status == SubscriptionStatus::Canceled.as_str() {
                return Ok(None);
            }
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let customer = self.stripe.retrieve_customer(&customer_id).await?;
        if customer.deleted {
            return Err(BillingError::CustomerGone(customer_id));
        }

        let detail = CustomerDetail {
            customer_id: customer_id.clone(),
            email: customer.email.clone(),
            name: customer.name.clone(),
            phone: customer.phone.clone(),
        };

        let linked: Vec<(Uuid, String, Option<String>)> = sqlx::query_as(
            "SELECT id, name, email FROM students WHERE stripe_subscription_id = $1",
        )
        .bind(&subscription_id)
        .fetch_all(&self.pool)
        .await?;

        if !linked.is_empty() {
            let status_matches = internal_status
                .as_ref()
                .map(|(s,)| s == fetched_status.as_str())
                .unwrap_or(false);
            let email_matches = detail.email.as_deref().is_some_and(|customer_email| {
                linked.iter().any(|(_, _, email)| {
                    email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(customer_email))
                })
            });

            if status_matches && email_matches {
                return Ok(None);
            }

            // Linked but drifted: the link itself is the candidate, the sync
            // in reconcile() repairs the status and period fields.
            let (id, name, _) = linked[0].clone();
            return Ok(Some(ReconciliationItem {
                subscription_id,
                subscription_status: fetched_status.as_str().to_string(),
                customer: detail,
                needs_reconciliation: true,
                is_unmatched: false,
                candidate: Some(MatchedParty::Student { id, name }),
                ambiguity: None,
                hints: CheckoutHints::default(),
            }));
        }

        // Nothing linked: run the resolver over unlinked students, with
        // whatever the payer typed into checkout custom fields folded in as
        // the softer signals. Email evidence keeps its precedence over the
        // hints here, unlike the checkout flow.
        let hints = self.checkout_hints(&customer_id, &subscription_id).await;
        let identity = ExternalIdentity {
            email: detail.email.clone(),
            name_hint: hints.student_name.clone(),
            phone: hints
                .student_phone
                .clone()
                .or_else(|| detail.phone.clone()),
            unlinked_students_only: true,
            ..Default::default()
        };
        let resolver = IdentityResolver::new(self.pool.clone());
        let resolution = resolver.resolve(&identity).await?;

        let (is_unmatched, candidate, ambiguity) = match resolution {
            Resolution::Match { party, .. } => (false, Some(party), None),
            Resolution::Ambiguous { stage, candidates } => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    stage = %stage,
                    candidates = candidates.len(),
                    "Scan resolution ambiguous, operator must pick"
                );
                (
                    false,
                    None,
                    Some(AmbiguousMatch {
                        stage: stage.to_string(),
                        candidates,
                    }),
                )
            }
            Resolution::Unmatched => (true, None, None),
        };

        Ok(Some(ReconciliationItem {
            subscription_id,
            subscription_status: fetched_status.as_str().to_string(),
            customer: detail,
            needs_reconciliation: true,
            is_unmatched,
            candidate,
            ambiguity,
            hints,
        }))
    }

    /// Best-effort custom-field hints from the customer's checkout sessions.
    /// A provider error here degrades matching quality, it does not fail the
    /// scan entry.
    async fn checkout_hints(&self, customer_id: &str, subscription_id: &str) -> CheckoutHints {
        let sessions = match self.stripe.list_checkout_sessions(customer_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to list checkout sessions for hints"
                );
                return CheckoutHints::default();
            }
        };

        let session = sessions.iter().find(|s| {
            matches!(
                &s.subscription,
                Some(stripe::Expandable::Id(id)) if id.as_str() == subscription_id
            ) || matches!(
                &s.subscription,
                Some(stripe::Expandable::Object(sub)) if sub.id.as_str() == subscription_id
            )
        });

        match session {
            Some(session) => CheckoutHints {
                student_name: custom_field_text(session, "name"),
                student_phone: custom_field_text(session, "phone"),
            },
            None => CheckoutHints::default(),
        }
    }

    /// Operator-confirmed repair: link the item's candidate student, then run
    /// the synchronizer so every derived field converges. Ambiguous items are
    /// rejected outright; the operator has to narrow them to one candidate.
    pub async fn reconcile(&self, item: &ReconciliationItem) -> BillingResult<SyncOutcome> {
        if let Some(ambiguity) = &item.ambiguity {
            return Err(BillingError::AmbiguousIdentity {
                stage: ambiguity.stage.clone(),
                candidates: ambiguity.candidates.len(),
            });
        }

        match &item.candidate {
            Some(MatchedParty::Student { id, name }) => {
                sqlx::query(
                    r#"
                    UPDATE students SET
                        stripe_subscription_id = $1,
                        email = COALESCE(email, $2),
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(&item.subscription_id)
                .bind(item.customer.email.as_ref())
                .bind(id)
                .execute(&self.pool)
                .await?;

                tracing::info!(
                    student_id = %id,
                    student_name = %name,
                    subscription_id = %item.subscription_id,
                    "Operator linked student to subscription"
                );
            }
            Some(MatchedParty::Payer { .. }) => {}
            None => {
                return Err(BillingError::InvalidPayload(format!(
                    "reconciliation item for {} carries no candidate",
                    item.subscription_id
                )))
            }
        }

        let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
        sync.sync(&item.customer.customer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StripeConfig;
    use sqlx::postgres::PgPoolOptions;

    fn item(needs: bool, unmatched: bool) -> ReconciliationItem {
        ReconciliationItem {
            subscription_id: "sub_1".to_string(),
            subscription_status: "active".to_string(),
            customer: CustomerDetail {
                customer_id: "cus_1".to_string(),
                email: Some("parent@example.com".to_string()),
                name: None,
                phone: None,
            },
            needs_reconciliation: needs,
            is_unmatched: unmatched,
            candidate: None,
            ambiguity: None,
            hints: CheckoutHints::default(),
        }
    }

    fn test_scanner() -> ReconciliationScanner {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_unused".to_string(),
            webhook_secret: "whsec_unused".to_string(),
            grace_period_days: 7,
            late_fee_cents: None,
            idempotency_ttl_days: 30,
        });
        // Never connected to; rejecting an ambiguous item must not need IO
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@127.0.0.1:1/unreachable")
            .unwrap();
        ReconciliationScanner::new(stripe, pool)
    }

    #[test]
    fn report_distinguishes_clean_from_errored_scans() {
        let clean = ScanReport {
            scanned: 10,
            items: vec![],
            errors: vec![],
        };
        let errored = ScanReport {
            scanned: 10,
            items: vec![],
            errors: vec![ScanError {
                subscription_id: "sub_1".to_string(),
                message: "stripe timeout".to_string(),
            }],
        };
        assert!(clean.errors.is_empty());
        assert!(!errored.errors.is_empty());
    }

    #[test]
    fn report_serializes_for_the_admin_surface() {
        let report = ScanReport {
            scanned: 2,
            items: vec![item(true, true)],
            errors: vec![],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scanned"], 2);
        assert_eq!(json["items"][0]["is_unmatched"], true);
        assert_eq!(json["items"][0]["customer"]["customer_id"], "cus_1");
    }

    #[tokio::test]
    async fn ambiguous_item_is_never_auto_reconciled() {
        let scanner = test_scanner();

        let mut ambiguous = item(true, false);
        ambiguous.ambiguity = Some(AmbiguousMatch {
            stage: "phone_digits".to_string(),
            candidates: vec![
                MatchedParty::Student {
                    id: uuid::Uuid::new_v4(),
                    name: "A".to_string(),
                },
                MatchedParty::Student {
                    id: uuid::Uuid::new_v4(),
                    name: "B".to_string(),
                },
            ],
        });

        let err = scanner.reconcile(&ambiguous).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::AmbiguousIdentity { candidates: 2, .. }
        ));
    }

    #[tokio::test]
    async fn item_without_a_candidate_is_rejected() {
        let scanner = test_scanner();
        let err = scanner.reconcile(&item(true, true)).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
    }
}
