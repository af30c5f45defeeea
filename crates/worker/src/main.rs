// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Seatline Background Worker
//!
//! Handles scheduled jobs including:
//! - Lapsed subscription expiry (hourly)
//! - Parked webhook event expiry (hourly, at half past)
//! - Billing invariant checks (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use seatline_billing::{BillingService, PgStore};
use seatline_shared::{create_pool, run_migrations};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Seatline Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(Arc::new(PgStore::new(pool)))?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire lapsed subscriptions
    // Cron: At minute 0 of every hour
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running lapsed subscription sweep");
                jobs::expire_lapsed_subscriptions(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Lapsed subscription expiry (hourly)");

    // Job 2: Drop parked webhook events past their TTL
    // Cron: At minute 30 of every hour
    let parked_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let billing = parked_billing.clone();
            Box::pin(async move {
                info!("Running parked webhook event sweep");
                jobs::expire_parked_events(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Parked webhook event expiry (hourly)");

    // Job 3: Invariant checks
    // Cron: At 3:00 AM UTC every day
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                jobs::check_invariants(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Seatline Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
