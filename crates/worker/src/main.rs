// Worker clippy configuration

//! Billmirror Background Worker
//!
//! Runs the scheduled reconciliation passes:
//! - Catalog sync: products and prices (every 6 hours)
//! - Billing state sync: customers, payment methods, invoices (daily at 2:30 UTC)
//! - Subscription sync (hourly at :15)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use billmirror_core::{EntityKind, MirrorService};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Run one kind after another, logging each report. Later kinds still run
/// when an earlier one fails.
async fn sync_kinds(service: &MirrorService, kinds: &[EntityKind]) {
    for &kind in kinds {
        match service.reconciler.sync_kind(kind).await {
            Ok(report) => info!(%report, "Sync pass complete"),
            Err(error) => error!(kind = %kind, %error, "Sync pass failed"),
        }
    }
}

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

    info!("Starting billmirror worker");

    let pool = billmirror_shared::create_pool().await?;
    billmirror_shared::run_migrations(&pool).await?;

    // If provider credentials are missing, keep the process alive but idle
    // so deploys without a key don't crash-loop.
    let service = match MirrorService::from_env(pool) {
        Ok(service) => Arc::new(service),
        Err(error) => {
            warn!(%error, "Failed to create mirror service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Catalog sync every 6 hours (0:00, 6:00, 12:00, 18:00 UTC).
    // Products first so price ownership resolves on the first pass.
    let catalog_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let service = catalog_service.clone();
            Box::pin(async move {
                info!("Running scheduled catalog sync");
                sync_kinds(&service, &[EntityKind::Product, EntityKind::Price]).await;
            })
        })?)
        .await?;
    info!("Scheduled: Catalog sync (every 6 hours)");

    // Job 2: Billing state sync daily at 2:30 UTC
    let billing_service = service.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let service = billing_service.clone();
            Box::pin(async move {
                info!("Running scheduled billing state sync");
                sync_kinds(
                    &service,
                    &[
                        EntityKind::Customer,
                        EntityKind::PaymentMethod,
                        EntityKind::Invoice,
                    ],
                )
                .await;
            })
        })?)
        .await?;
    info!("Scheduled: Billing state sync (daily at 2:30 UTC)");

    // Job 3: Subscription sync hourly at :15
    let subscription_service = service.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let service = subscription_service.clone();
            Box::pin(async move {
                info!("Running scheduled subscription sync");
                sync_kinds(&service, &[EntityKind::Subscription]).await;
            })
        })?)
        .await?;
    info!("Scheduled: Subscription sync (hourly at :15)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Billmirror worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
