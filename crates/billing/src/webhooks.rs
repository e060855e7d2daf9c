//! Stripe webhook event router
//!
//! Verifies incoming webhook payloads, gates them through the processed-event
//! store, and dispatches the five event types the engine reacts to. Handler
//! errors propagate to the HTTP layer as failures so Stripe redelivers;
//! malformed payloads are logged and acknowledged since redelivering them can
//! never succeed.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::Arc;
use stripe::{
    CheckoutSession, CheckoutSessionMode, Event, EventObject, EventType, Invoice, Subscription,
    Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::idempotency::IdempotencyStore;
use crate::identity::{IdentityResolver, MatchedParty, Resolution};
use crate::ledger::PaymentLedgerWriter;
use crate::metadata::covered_student_ids;
use crate::sync::SubscriptionSynchronizer;

type HmacSha256 = Hmac<Sha256>;

/// Routes verified Stripe events to the engine's handlers
pub struct WebhookRouter {
    stripe: StripeClient,
    pool: PgPool,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl WebhookRouter {
    pub fn new(stripe: StripeClient, pool: PgPool, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            stripe,
            pool,
            idempotency,
        }
    }

    /// Verify and parse a Stripe webhook payload.
    ///
    /// Tries the stripe crate's verifier first, then falls back to manual
    /// signature verification; construct_event rejects payloads from newer
    /// Stripe API versions even when the signature itself is fine.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let (timestamp, v1_signature) = parse_signature_header(signature).ok_or_else(|| {
            tracing::error!("Malformed Stripe-Signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// The idempotency gate runs before any side-effecting work. A failure
    /// while consulting the store is treated as "not yet processed": every
    /// handler is idempotent, so re-running one is safe where dropping an
    /// event is not. The event is only recorded after its handler succeeds,
    /// so a failed handler gets another chance on redelivery.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        match self.idempotency.has_processed(&event_id).await {
            Ok(true) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook delivery, skipping"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Idempotency check failed, processing anyway"
                );
            }
        }

        let customer_id = event_customer_id(&event);

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        match self.dispatch(event).await {
            Ok(()) => {
                if let Err(e) = self
                    .idempotency
                    .mark_processed(&event_id, &event_type, customer_id.as_deref())
                    .await
                {
                    // A redelivery that slips past a failed mark just re-runs
                    // an idempotent handler.
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to record processed event"
                    );
                }
                Ok(())
            }
            Err(BillingError::InvalidPayload(reason)) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    reason = %reason,
                    "Malformed webhook payload, acknowledging without processing"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
                self.handle_invoice_paid(event).await
            }
            EventType::InvoicePaymentFailed => self.handle_invoice_failed(event).await,
            EventType::CustomerSubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    /// checkout.session.completed: link the new subscription to a student.
    ///
    /// Payment-mode sessions are ignored. If a student already carries the
    /// subscription id the link step is a no-op; otherwise the resolver is
    /// asked for exactly one unlinked student using the session's custom
    /// fields and payer email. An ambiguous or empty result is logged for
    /// manual review, never guessed at. The sync runs in every branch so the
    /// payer and subscription rows exist regardless of the link outcome.
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = extract_checkout_session(event)?;

        if session.mode != CheckoutSessionMode::Subscription {
            tracing::info!(
                session_id = %session.id,
                mode = ?session.mode,
                "Checkout session is not subscription mode, ignoring"
            );
            return Ok(());
        }

        let subscription_id = match &session.subscription {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(sub)) => sub.id.to_string(),
            None => {
                return Err(BillingError::InvalidPayload(
                    "subscription-mode checkout session has no subscription".to_string(),
                ))
            }
        };

        let customer_id = match &session.customer {
            Some(expandable) => expandable_customer_id(expandable),
            None => {
                return Err(BillingError::InvalidPayload(
                    "checkout session has no customer".to_string(),
                ))
            }
        };

        let already_linked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM students WHERE stripe_subscription_id = $1 LIMIT 1")
                .bind(&subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((student_id,)) = already_linked {
            tracing::info!(
                subscription_id = %subscription_id,
                student_id = %student_id,
                "Subscription already linked to a student"
            );
            let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
            sync.sync(&customer_id).await?;
            return Ok(());
        }

        let name_hint = custom_field_text(&session, "name");
        let phone_hint = custom_field_text(&session, "phone").or_else(|| {
            session
                .customer_details
                .as_ref()
                .and_then(|d| d.phone.clone())
        });
        let payer_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| session.customer_email.clone());

        let resolver = IdentityResolver::new(self.pool.clone());
        let resolution = resolver
            .resolve_unlinked_student(
                name_hint.as_deref(),
                phone_hint.as_deref(),
                payer_email.as_deref(),
            )
            .await?;

        match resolution {
            Resolution::Match { stage, party } => {
                let (student_id, student_name) = match &party {
                    MatchedParty::Student { id, name } => (*id, name.clone()),
                    // The unlinked-student cascade only returns students
                    MatchedParty::Payer { id, .. } => {
                        return Err(BillingError::Internal(format!(
                            "checkout resolution returned payer {}",
                            id
                        )));
                    }
                };

                sqlx::query(
                    r#"
                    UPDATE students SET
                        stripe_subscription_id = $1,
                        enrollment_status = 'enrolled',
                        email = COALESCE(email, $2),
                        phone = COALESCE(phone, $3),
                        updated_at = NOW()
                    WHERE id = $4
                    "#,
                )
                .bind(&subscription_id)
                .bind(payer_email.as_ref())
                .bind(phone_hint.as_ref())
                .bind(student_id)
                .execute(&self.pool)
                .await?;

                tracing::info!(
                    student_id = %student_id,
                    student_name = %student_name,
                    subscription_id = %subscription_id,
                    stage = %stage,
                    "Linked checkout subscription to student"
                );
            }
            Resolution::Ambiguous { stage, candidates } => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    customer_id = %customer_id,
                    stage = %stage,
                    candidates = candidates.len(),
                    "Checkout matched several students, leaving unlinked for manual review"
                );
            }
            Resolution::Unmatched => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    customer_id = %customer_id,
                    name_hint = ?name_hint,
                    "Checkout matched no student, leaving unlinked for manual review"
                );
            }
        }

        let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
        sync.sync(&customer_id).await?;
        Ok(())
    }

    /// invoice.payment_succeeded / invoice.paid: append ledger rows for the
    /// covered students, then converge subscription state.
    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let paid_at = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let invoice = extract_invoice(event)?;
        let invoice_id = invoice.id.to_string();

        let subscription_id = match &invoice.subscription {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(sub)) => sub.id.to_string(),
            None => {
                tracing::info!(
                    invoice_id = %invoice_id,
                    "Invoice is not subscription-backed, ignoring"
                );
                return Ok(());
            }
        };

        // The event payload may be stale by the time we run; the ledger
        // entry is written from a fresh read.
        let invoice = self.stripe.retrieve_invoice(&invoice_id).await?;

        let customer_id = match &invoice.customer {
            Some(expandable) => expandable_customer_id(expandable),
            None => {
                return Err(BillingError::InvalidPayload(format!(
                    "invoice {} has no customer",
                    invoice_id
                )))
            }
        };

        let period_start = invoice_period_start(&invoice).unwrap_or(paid_at);
        let amount_paid = invoice.amount_paid.unwrap_or(0);

        let linked: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM students WHERE stripe_subscription_id = $1")
                .bind(&subscription_id)
                .fetch_all(&self.pool)
                .await?;
        let mut student_ids: Vec<Uuid> = linked.into_iter().map(|(id,)| id).collect();

        // No stored links yet, e.g. the invoice event raced the checkout
        // event. Fall back to the subscription's own metadata.
        if student_ids.is_empty() {
            let subscription = self.stripe.retrieve_subscription(&subscription_id).await?;
            student_ids = covered_student_ids(&subscription.metadata);
        }

        let ledger = PaymentLedgerWriter::new(self.pool.clone());
        ledger
            .record_invoice_payment(&invoice_id, &student_ids, amount_paid, period_start, paid_at)
            .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET last_payment_date = $1, updated_at = NOW()
            WHERE stripe_subscription_id = $2
            "#,
        )
        .bind(paid_at)
        .bind(&subscription_id)
        .execute(&self.pool)
        .await?;

        let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
        sync.sync(&customer_id).await?;
        Ok(())
    }

    /// invoice.payment_failed: converge state first (the sync marks the
    /// subscription past due and opens its grace window), then assess the
    /// configured late fee as a pending invoice item on the next invoice.
    /// The fee is deduplicated by description so Stripe's retry schedule
    /// assesses it once per billing month.
    async fn handle_invoice_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;
        let invoice_id = invoice.id.to_string();

        if invoice.subscription.is_none() {
            tracing::info!(
                invoice_id = %invoice_id,
                "Failed invoice is not subscription-backed, ignoring"
            );
            return Ok(());
        }

        let customer_id = match &invoice.customer {
            Some(expandable) => expandable_customer_id(expandable),
            None => {
                return Err(BillingError::InvalidPayload(format!(
                    "invoice {} has no customer",
                    invoice_id
                )))
            }
        };

        tracing::warn!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            amount_due = invoice.amount_due,
            "Invoice payment failed"
        );

        let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
        sync.sync(&customer_id).await?;

        let fee_cents = self
            .stripe
            .config()
            .late_fee_cents
            .ok_or(BillingError::MissingConfig("LATE_FEE_CENTS"))?;

        let period_start = invoice_period_start(&invoice).unwrap_or_else(OffsetDateTime::now_utc);
        let description = late_fee_description(period_start);

        let pending = self.stripe.list_pending_invoice_items(&customer_id).await?;
        let already_assessed = pending
            .iter()
            .any(|item| item.description.as_deref() == Some(description.as_str()));

        if already_assessed {
            tracing::info!(
                customer_id = %customer_id,
                description = %description,
                "Late fee already pending for this billing month, skipping"
            );
            return Ok(());
        }

        self.stripe
            .create_invoice_item(&customer_id, fee_cents, &description)
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            fee_cents = fee_cents,
            description = %description,
            "Assessed late fee as pending invoice item"
        );
        Ok(())
    }

    /// customer.subscription.updated: whatever changed, the sync converges on
    /// the provider's current state.
    async fn handle_subscription_updated(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let customer_id = expandable_customer_id(&subscription.customer);

        tracing::info!(
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Subscription updated"
        );

        let sync = SubscriptionSynchronizer::new(self.stripe.clone(), self.pool.clone());
        sync.sync(&customer_id).await?;
        Ok(())
    }

    /// customer.subscription.deleted: terminal. The students lose their
    /// subscription link entirely, unlike the updated handler which only
    /// adjusts status; a deleted subscription id never comes back.
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let subscription_id = subscription.id.to_string();

        let mut tx = self.pool.begin().await?;

        let unlinked = sqlx::query(
            r#"
            UPDATE students SET
                subscription_status = 'canceled',
                enrollment_status = 'registered',
                stripe_subscription_id = NULL,
                paid_until = NULL,
                next_payment_due = NULL,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&subscription_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'canceled',
                grace_period_end = NULL,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&subscription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            students_unlinked = unlinked.rows_affected(),
            "Subscription deleted, students unlinked"
        );
        Ok(())
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::InvalidPayload(
            "expected a subscription object".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::InvalidPayload(
            "expected an invoice object".to_string(),
        )),
    }
}

fn extract_checkout_session(event: Event) -> BillingResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(BillingError::InvalidPayload(
            "expected a checkout session object".to_string(),
        )),
    }
}

/// Customer id carried by the event's payload object, for the processed-event
/// record
fn event_customer_id(event: &Event) -> Option<String> {
    let expandable = match &event.data.object {
        EventObject::Subscription(sub) => &sub.customer,
        EventObject::Invoice(invoice) => invoice.customer.as_ref()?,
        EventObject::CheckoutSession(session) => session.customer.as_ref()?,
        _ => return None,
    };
    Some(expandable_customer_id(expandable))
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

/// First text custom field whose key contains `needle`, e.g. "student_name"
pub(crate) fn custom_field_text(session: &CheckoutSession, needle: &str) -> Option<String> {
    session
        .custom_fields
        .iter()
        .find(|field| field.key.contains(needle))
        .and_then(|field| field.text.as_ref())
        .and_then(|text| text.value.clone())
        .filter(|value| !value.trim().is_empty())
}

/// Billing period start of an invoice: the first line item that carries a
/// period, falling back to the invoice-level period
fn invoice_period_start(invoice: &Invoice) -> Option<OffsetDateTime> {
    let from_lines = invoice.lines.as_ref().and_then(|lines| {
        lines
            .data
            .iter()
            .find_map(|line| line.period.as_ref().and_then(|p| p.start))
    });

    from_lines
        .or(invoice.period_start)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// The dedup key for late fees: one fee per billing month
fn late_fee_description(period_start: OffsetDateTime) -> String {
    format!(
        "Late payment fee for {}-{:02}",
        period_start.year(),
        u8::from(period_start.month())
    )
}

/// Parse a `Stripe-Signature` header into its timestamp and v1 signature
fn parse_signature_header(signature: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;

    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }

    Some((timestamp?, v1?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StripeConfig;
    use crate::idempotency::InMemoryIdempotencyStore;
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use time::macros::datetime;

    fn test_router(store: Arc<dyn IdempotencyStore>) -> WebhookRouter {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_unused".to_string(),
            webhook_secret: "whsec_unused".to_string(),
            grace_period_days: 7,
            late_fee_cents: None,
            idempotency_ttl_days: 30,
        });
        // Any dispatch that reaches the database fails loudly
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@127.0.0.1:1/unreachable")
            .unwrap();
        WebhookRouter::new(stripe, pool, store)
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> Event {
        serde_json::from_value(json!({
            "id": id,
            "object": "event",
            "created": 1712000000,
            "data": { "object": object },
            "livemode": false,
            "pending_webhooks": 0,
            "type": event_type,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped_before_dispatch() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        store
            .mark_processed("evt_dup", "invoice.payment_failed", Some("cus_1"))
            .await
            .unwrap();
        let router = test_router(store);

        // If the gate let this through, the handler would sync against the
        // unreachable database and error out.
        let event = event(
            "evt_dup",
            "invoice.payment_failed",
            json!({
                "id": "in_1",
                "object": "invoice",
                "customer": "cus_1",
                "subscription": "sub_1",
            }),
        );
        assert!(router.handle_event(event).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_payload_is_acknowledged_without_processing() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let router = test_router(store.clone());

        // A subscription event carrying an invoice object can never be
        // handled; it must be acked so Stripe stops redelivering it.
        let event = event(
            "evt_bad",
            "customer.subscription.updated",
            json!({
                "id": "in_1",
                "object": "invoice",
            }),
        );
        assert!(router.handle_event(event).await.is_ok());
        assert!(!store.has_processed("evt_bad").await.unwrap());
    }

    #[tokio::test]
    async fn handled_event_is_recorded_for_replay_suppression() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let router = test_router(store.clone());

        // Unhandled types pass through dispatch as a success and get recorded
        let event = event(
            "evt_new",
            "customer.created",
            json!({
                "id": "cus_1",
                "object": "customer",
            }),
        );
        router.handle_event(event).await.unwrap();
        assert!(store.has_processed("evt_new").await.unwrap());
    }

    #[test]
    fn signature_header_parses_timestamp_and_v1() {
        let header = "t=1712000000,v1=abc123,v0=legacy";
        assert_eq!(
            parse_signature_header(header),
            Some((1712000000, "abc123".to_string()))
        );
    }

    #[test]
    fn signature_header_without_v1_is_rejected() {
        assert!(parse_signature_header("t=1712000000,v0=legacy").is_none());
        assert!(parse_signature_header("garbage").is_none());
    }

    #[test]
    fn late_fee_description_is_stable_within_a_month() {
        let a = late_fee_description(datetime!(2026-03-01 00:00 UTC));
        let b = late_fee_description(datetime!(2026-03-28 12:30 UTC));
        assert_eq!(a, b);
        assert_eq!(a, "Late payment fee for 2026-03");
    }

    #[test]
    fn late_fee_description_distinguishes_months() {
        let march = late_fee_description(datetime!(2026-03-01 00:00 UTC));
        let april = late_fee_description(datetime!(2026-04-01 00:00 UTC));
        assert_ne!(march, april);
    }
}
