use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info, warn};

use crate::events::FlushReport;
use crate::ledger::{reconcile, refunded_share, LedgerReport};
use crate::platform::BillingPlatform;

/// key: billing-reconciliation -> background repair jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationJob {
    /// Compare cached balances with the transaction log.
    LedgerAudit,
    /// Fail PENDING payments nobody captured in time.
    PaymentSweep,
    /// Re-enqueue status events lost between a write and its outbox entry.
    RederiveEvents,
    FlushOutbox,
    /// Re-run grant reversals for refunded payments and collect earlier shortfalls.
    RefundReversals,
    /// All of the above, in that order.
    Full,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconciliationOutcome {
    pub ledger: Option<LedgerReport>,
    pub abandoned_payments: usize,
    pub rederived_events: usize,
    pub flush: FlushReport,
    /// Reversal entries written by this run.
    pub repaired_reversals: usize,
    /// Refunded credit still held back because the user had already spent it.
    pub reversal_shortfall: Decimal,
    pub dead_lettered_events: usize,
}

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(platform: Arc<BillingPlatform>) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match run_job(&platform, job).await {
                Ok(outcome) => {
                    if outcome
                        .ledger
                        .as_ref()
                        .is_some_and(|report| !report.is_consistent())
                    {
                        warn!(?job, "reconciliation found ledger discrepancies");
                    }
                }
                Err(err) => error!(?err, ?job, "billing reconciliation job failed"),
            }
        }
    });

    ReconciliationHandle { sender: tx }
}

/// Runs one job inline; the worker uses this and so can callers that need the outcome.
pub async fn run_job(
    platform: &BillingPlatform,
    job: ReconciliationJob,
) -> Result<ReconciliationOutcome> {
    let mut outcome = ReconciliationOutcome::default();
    let full = job == ReconciliationJob::Full;

    if full || job == ReconciliationJob::LedgerAudit {
        outcome.ledger = Some(
            reconcile(platform.ledger.as_ref())
                .await
                .context("ledger audit failed")?,
        );
    }
    if full || job == ReconciliationJob::PaymentSweep {
        outcome.abandoned_payments = platform
            .payments
            .sweep_stale_pending(platform.config.pending_payment_timeout)
            .await
            .context("stale payment sweep failed")?
            .len();
    }
    if full || job == ReconciliationJob::RederiveEvents {
        let since = platform.clock.now() - platform.config.outbox_retention;
        outcome.rederived_events = platform
            .payments
            .rederive_events(since)
            .await
            .context("payment event re-derivation failed")?
            + platform
                .subscriptions
                .rederive_events(since)
                .await
                .context("subscription event re-derivation failed")?;
    }
    if full || job == ReconciliationJob::FlushOutbox || outcome.rederived_events > 0 {
        outcome.flush = platform.outbox.flush().await;
        outcome.dead_lettered_events = platform
            .outbox
            .dead_lettered()
            .await
            .context("dead-letter listing failed")?
            .len();
        if outcome.dead_lettered_events > 0 {
            error!(
                dead_lettered = outcome.dead_lettered_events,
                "outbox holds dead-lettered events awaiting requeue"
            );
        }
    }
    if full || job == ReconciliationJob::RefundReversals {
        for payment in platform
            .payments
            .refunded()
            .await
            .context("refunded payment listing failed")?
        {
            let reversal = platform
                .credits
                .reverse_payment_grants(payment.id, refunded_share(&payment))
                .await
                .with_context(|| format!("grant reversal for payment {} failed", payment.id))?;
            outcome.repaired_reversals += reversal.reversals.len();
            if !reversal.is_complete() {
                error!(
                    payment_id = %payment.id,
                    user_id = %payment.user_id,
                    shortfall = %reversal.shortfall,
                    "refunded credits still outstanding"
                );
                outcome.reversal_shortfall += reversal.shortfall;
            }
        }
    }

    info!(
        ?job,
        abandoned = outcome.abandoned_payments,
        rederived = outcome.rederived_events,
        delivered = outcome.flush.delivered,
        failed = outcome.flush.failed,
        dead_lettered = outcome.dead_lettered_events,
        repaired_reversals = outcome.repaired_reversals,
        reversal_shortfall = %outcome.reversal_shortfall,
        "billing reconciliation job finished"
    );
    Ok(outcome)
}
