use std::sync::Arc;

use anyhow::Context;
use billing_core::billing::{
    spawn_billing_scheduler, start_reconciliation_worker, ReconciliationJob, SandboxGateway,
};
use billing_core::{config, telemetry, BillingConfig, BillingPlatform, SystemClock};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    dotenvy::dotenv().ok();

    let config = BillingConfig::from_env();
    let plans = config.load_plans()?;
    tracing::info!(
        plans = plans.len(),
        scan_interval_secs = config.expiration_scan_interval.as_secs(),
        grace_days = config.suspension_grace.num_days(),
        durable = config.database_url.is_some(),
        "starting billing core"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let gateway = Arc::new(SandboxGateway);
    let clock = Arc::new(SystemClock);
    let platform = match config.database_url.clone() {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&db_url)
                .await
                .context("failed to connect to billing database")?;

            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(error).context("billing database migrations failed");
                }
            }
            BillingPlatform::postgres(config, pool, gateway, plans, clock)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; billing state lives in memory only");
            BillingPlatform::in_memory(config, gateway, plans, clock)
        }
    }
    .context("failed to wire billing platform")?;
    let platform = Arc::new(platform);

    let reconciliation = start_reconciliation_worker(platform.clone());
    reconciliation.dispatch(ReconciliationJob::Full).await?;
    let scheduler = spawn_billing_scheduler(platform.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    scheduler.abort();
    let flushed = platform.outbox.flush().await;
    let undelivered = platform
        .outbox
        .pending()
        .await
        .context("failed to read outbox at shutdown")?;
    tracing::info!(
        delivered = flushed.delivered,
        undelivered = undelivered.len(),
        dead_lettered = flushed.dead_lettered,
        "final outbox flush"
    );

    Ok(())
}
