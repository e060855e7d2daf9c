//! Processed-event tracking
//!
//! Stripe delivers webhooks at least once, so the router keeps a TTL'd record
//! of every event id it has applied. The record is consulted before any
//! side-effecting work begins. A failure while checking is treated as "not
//! yet processed": re-running an idempotent sync is safe, silently dropping
//! an event is not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

/// Metadata stored against a processed event id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_type: String,
    pub customer_id: Option<String>,
    pub processed_at: OffsetDateTime,
}

/// Storage backend for processed-event records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether a live record exists for this event id
    async fn has_processed(&self, event_id: &str) -> BillingResult<bool>;

    /// Record an event as applied. Overwriting an existing record (a racing
    /// duplicate delivery) is harmless.
    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        customer_id: Option<&str>,
    ) -> BillingResult<()>;

    /// Fetch the stored record, if any
    async fn get(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>>;
}

fn record_key(event_id: &str) -> String {
    format!("webhook:event:{}", event_id)
}

/// Redis-backed store; the TTL handles retention, no cleanup job needed
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub fn new(conn: redis::aio::ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    pub async fn connect(redis_url: &str, ttl: Duration) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(conn, ttl))
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_processed(&self, event_id: &str) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(record_key(event_id)).await?;
        Ok(exists)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let record = ProcessedEvent {
            event_type: event_type.to_string(),
            customer_id: customer_id.map(str::to_string),
            processed_at: OffsetDateTime::now_utc(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| BillingError::Internal(format!("serialize processed event: {}", e)))?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(record_key(event_id), payload, self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(record_key(event_id)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }
}

/// In-memory store for tests and single-process development
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<RwLock<HashMap<String, (ProcessedEvent, Instant)>>>,
    ttl: Option<Duration>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: Some(ttl),
        }
    }

    fn live(&self, inserted: Instant) -> bool {
        match self.ttl {
            Some(ttl) => inserted.elapsed() <= ttl,
            None => true,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has_processed(&self, event_id: &str) -> BillingResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(event_id)
            .map(|(_, at)| self.live(*at))
            .unwrap_or(false))
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let record = ProcessedEvent {
            event_type: event_type.to_string(),
            customer_id: customer_id.map(str::to_string),
            processed_at: OffsetDateTime::now_utc(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(event_id.to_string(), (record, Instant::now()));
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(event_id)
            .filter(|(_, at)| self.live(*at))
            .map(|(rec, _)| rec.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_event_is_not_processed() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.has_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn marked_event_is_processed() {
        let store = InMemoryIdempotencyStore::new();
        store
            .mark_processed("evt_1", "invoice.payment_succeeded", Some("cus_1"))
            .await
            .unwrap();

        assert!(store.has_processed("evt_1").await.unwrap());

        let record = store.get("evt_1").await.unwrap().unwrap();
        assert_eq!(record.event_type, "invoice.payment_succeeded");
        assert_eq!(record.customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn duplicate_mark_is_a_harmless_overwrite() {
        let store = InMemoryIdempotencyStore::new();
        store
            .mark_processed("evt_1", "invoice.paid", None)
            .await
            .unwrap();
        store
            .mark_processed("evt_1", "invoice.paid", Some("cus_1"))
            .await
            .unwrap();

        let record = store.get("evt_1").await.unwrap().unwrap();
        assert_eq!(record.customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn expired_record_reads_as_unprocessed() {
        let store = InMemoryIdempotencyStore::with_ttl(Duration::from_millis(10));
        store
            .mark_processed("evt_1", "invoice.paid", None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!store.has_processed("evt_1").await.unwrap());
        assert!(store.get("evt_1").await.unwrap().is_none());
    }
}
