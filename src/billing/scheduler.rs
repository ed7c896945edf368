use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::platform::BillingPlatform;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub expired_subscriptions: usize,
    pub abandoned_payments: usize,
    pub delivered_events: usize,
    pub undelivered_events: usize,
    pub pruned_events: usize,
    pub pruned_marks: usize,
}

/// key: billing-expiration-scheduler -> periodic expiry, stale-payment sweep, outbox flush
/// and pruning of delivered events past the retention window
pub fn spawn(platform: Arc<BillingPlatform>) -> JoinHandle<()> {
    let interval = platform.config.expiration_scan_interval;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&platform).await {
                warn!(?err, "billing expiration tick failed");
            }
        }
    })
}

/// key: billing-expiration-scheduler -> tick handler
pub async fn process_tick(platform: &BillingPlatform) -> Result<TickReport> {
    let expired = platform
        .subscriptions
        .check_expirations()
        .await
        .context("expiration scan failed")?;
    let abandoned = platform
        .payments
        .sweep_stale_pending(platform.config.pending_payment_timeout)
        .await
        .context("stale payment sweep failed")?;
    let flushed = platform.outbox.flush().await;
    let undelivered = platform
        .outbox
        .pending()
        .await
        .context("outbox listing failed")?;

    let cutoff = platform.clock.now() - platform.config.outbox_retention;
    let pruned_events = platform
        .outbox
        .prune_delivered(cutoff)
        .await
        .context("outbox pruning failed")?;
    let pruned_marks = platform
        .prune_processed_events(cutoff)
        .await
        .context("processed event pruning failed")?;

    let report = TickReport {
        expired_subscriptions: expired.len(),
        abandoned_payments: abandoned.len(),
        delivered_events: flushed.delivered,
        undelivered_events: undelivered.len(),
        pruned_events,
        pruned_marks,
    };
    if report == TickReport::default() {
        debug!("billing expiration tick found nothing to do");
    } else {
        info!(
            expired = report.expired_subscriptions,
            abandoned = report.abandoned_payments,
            delivered = report.delivered_events,
            undelivered = report.undelivered_events,
            pruned_events = report.pruned_events,
            pruned_marks = report.pruned_marks,
            "billing expiration tick finished"
        );
    }
    Ok(report)
}
