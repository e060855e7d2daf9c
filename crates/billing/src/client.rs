//! Stripe client wrapper and engine configuration
//!
//! All outbound provider calls go through [`StripeClient`] so the rest of the
//! engine receives the client as an explicit dependency instead of reaching
//! for a global.

use stripe::{
    BalanceTransaction, CheckoutSession, Customer, CustomerId, Invoice, InvoiceId, InvoiceItem,
    ListBalanceTransactions, ListCheckoutSessions, ListInvoiceItems, ListSubscriptions, PayoutId,
    Subscription, SubscriptionStatusFilter,
};

use crate::error::{BillingError, BillingResult};

/// Engine configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Days a past-due subscription keeps its student enrolled
    pub grace_period_days: i64,
    /// Flat late fee added after a failed invoice payment. Optional: the
    /// invoice-failed handler raises `MissingConfig` when it needs this and
    /// it is not set.
    pub late_fee_cents: Option<i64>,
    /// Retention window for processed-event records
    pub idempotency_ttl_days: u64,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::MissingConfig("STRIPE_SECRET_KEY"))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::MissingConfig("STRIPE_WEBHOOK_SECRET"))?;

        let grace_period_days = std::env::var("GRACE_PERIOD_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7);

        let late_fee_cents = std::env::var("LATE_FEE_CENTS")
            .ok()
            .and_then(|v| v.parse().ok());

        let idempotency_ttl_days = std::env::var("IDEMPOTENCY_TTL_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            secret_key,
            webhook_secret,
            grace_period_days,
            late_fee_cents,
            idempotency_ttl_days,
        })
    }
}

/// Shared Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Retrieve a customer by id
    pub async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Customer> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;
        Ok(Customer::retrieve(&self.inner, &id, &[]).await?)
    }

    /// List every subscription for a customer, regardless of status.
    ///
    /// The sync step needs the full set: a subscription missing from this list
    /// is no longer enumerable and gets its internal row marked canceled.
    pub async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;

        let mut all = Vec::new();
        let mut starting_after = None;

        loop {
            let params = ListSubscriptions {
                customer: Some(id.clone()),
                status: Some(SubscriptionStatusFilter::All),
                limit: Some(100),
                starting_after: starting_after.clone(),
                ..Default::default()
            };
            let page = Subscription::list(&self.inner, &params).await?;
            let has_more = page.has_more;
            starting_after = page.data.last().map(|s| s.id.clone());
            all.extend(page.data);
            if !has_more || starting_after.is_none() {
                break;
            }
        }

        Ok(all)
    }

    /// List one page of externally-active subscriptions (reconciliation scan)
    pub async fn list_active_subscriptions_page(
        &self,
        starting_after: Option<stripe::SubscriptionId>,
        limit: u64,
    ) -> BillingResult<stripe::List<Subscription>> {
        let params = ListSubscriptions {
            status: Some(SubscriptionStatusFilter::Active),
            limit: Some(limit),
            starting_after,
            ..Default::default()
        };
        Ok(Subscription::list(&self.inner, &params).await?)
    }

    /// Retrieve a subscription by id
    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid subscription id: {}", e)))?;
        Ok(Subscription::retrieve(&self.inner, &id, &[]).await?)
    }

    /// Retrieve an invoice with its line items
    pub async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid invoice id: {}", e)))?;
        Ok(Invoice::retrieve(&self.inner, &id, &[]).await?)
    }

    /// List pending (not yet invoiced) invoice items for a customer
    pub async fn list_pending_invoice_items(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<InvoiceItem>> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;

        let mut params = ListInvoiceItems::new();
        params.customer = Some(id);
        params.pending = Some(true);
        params.limit = Some(100);

        let page = InvoiceItem::list(&self.inner, &params).await?;
        Ok(page.data)
    }

    /// Create a pending invoice item (late fee) that lands on the next invoice
    pub async fn create_invoice_item(
        &self,
        customer_id: &str,
        amount_cents: i64,
        description: &str,
    ) -> BillingResult<InvoiceItem> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;

        let mut params = stripe::CreateInvoiceItem::new(id);
        params.amount = Some(amount_cents);
        params.currency = Some(stripe::Currency::USD);
        params.description = Some(description);

        Ok(InvoiceItem::create(&self.inner, params).await?)
    }

    /// List recent checkout sessions for a customer. Used by the scanner to
    /// lazily pull custom-field hints (student name, phone) for matching.
    pub async fn list_checkout_sessions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<CheckoutSession>> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;

        let mut params = ListCheckoutSessions::new();
        params.customer = Some(id);
        params.limit = Some(20);

        let page = CheckoutSession::list(&self.inner, &params).await?;
        Ok(page.data)
    }

    /// List balance transactions belonging to one payout (profit-share report)
    pub async fn list_payout_transactions(
        &self,
        payout_id: &str,
    ) -> BillingResult<Vec<BalanceTransaction>> {
        let id = payout_id
            .parse::<PayoutId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid payout id: {}", e)))?;

        let params = ListBalanceTransactions {
            payout: Some(id),
            limit: Some(100),
            ..Default::default()
        };
        let page = BalanceTransaction::list(&self.inner, &params).await?;
        Ok(page.data)
    }
}
