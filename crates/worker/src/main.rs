#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tuition background worker
//!
//! Runs the scheduled jobs that keep billing state honest between webhook
//! deliveries: a nightly reconciliation scan, an hourly grace period sweep,
//! and a heartbeat.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tuition_billing::ReconciliationEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tuition_worker=debug".into()),
        )
        .init();

    tracing::info!("Starting tuition worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;
    tracing::info!("Database connection established");

    let engine = match ReconciliationEngine::from_env(pool.clone()).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation engine init failed, running heartbeat only");
            run_heartbeat_only().await;
            return Ok(());
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Nightly reconciliation scan at 02:30 UTC, after Stripe's own invoice
    // batches have settled.
    let scan_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let engine = scan_engine.clone();
            Box::pin(async move {
                tracing::info!("Starting nightly reconciliation scan");
                match engine.scanner.scan().await {
                    Ok(report) => log_scan_report(&report),
                    Err(e) => tracing::error!(error = %e, "Reconciliation scan failed"),
                }
            })
        })?)
        .await?;

    // Hourly grace period sweep.
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                if let Err(e) = sweep_expired_grace_periods(&pool).await {
                    tracing::error!(error = %e, "Grace period sweep failed");
                }
            })
        })?)
        .await?;

    // Heartbeat every 5 minutes.
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                tracing::debug!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("Scheduler started, worker running");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

fn log_scan_report(report: &tuition_billing::ScanReport) {
    tracing::info!(
        scanned = report.scanned,
        flagged = report.items.len(),
        errors = report.errors.len(),
        "Reconciliation scan complete"
    );

    for item in &report.items {
        tracing::warn!(
            subscription_id = %item.subscription_id,
            customer_id = %item.customer.customer_id,
            unmatched = item.is_unmatched,
            "Subscription needs reconciliation"
        );
    }

    for error in &report.errors {
        tracing::error!(
            subscription_id = %error.subscription_id,
            error = %error.message,
            "Subscription could not be inspected"
        );
    }
}

/// Drop students back to registered once a past due subscription has run out
/// its grace period without payment.
async fn sweep_expired_grace_periods(pool: &PgPool) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE students
        SET enrollment_status = 'registered', updated_at = NOW()
        WHERE enrollment_status = 'enrolled'
          AND stripe_subscription_id IN (
              SELECT stripe_subscription_id FROM subscriptions
              WHERE status = 'past_due' AND grace_period_end < NOW()
          )
        "#,
    )
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        tracing::info!(
            students = result.rows_affected(),
            "Dropped students whose grace period expired"
        );
    }

    Ok(())
}

async fn run_heartbeat_only() {
    loop {
        tokio::time::sleep(Duration::from_secs(300)).await;
        tracing::debug!("Worker heartbeat (minimal mode)");
    }
}
