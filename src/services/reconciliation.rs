//! Reconciliation engine: the safety net for callbacks that never
//! arrive. One sweep queries the gateway for still-Pending collections;
//! a second cancels entries Pending past a hard deadline.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::daraja::PaymentGateway;
use crate::domain::TransactionStatus;
use crate::ports::{LedgerError, TransactionLedger};
use crate::services::payments::PaymentService;

pub const RECONCILE_INTERVAL_SECS: u64 = 300;
pub const TIMEOUT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Entries younger than this are left alone; their callback may simply
/// still be in flight.
pub const DEFAULT_ACTIVE_WINDOW_MINS: i64 = 2;
/// Entries Pending longer than this are abandoned.
pub const DEFAULT_GRACE_PERIOD_HOURS: i64 = 24;

const TIMEOUT_DETAIL: &str = "Timeout - No response after 24 hours";

#[derive(Clone)]
pub struct ReconciliationService {
    ledger: Arc<dyn TransactionLedger>,
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentService,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub failed_queries: usize,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentService,
    ) -> Self {
        Self {
            ledger,
            gateway,
            payments,
        }
    }

    /// Queries the gateway for each Pending collection older than the
    /// active window and applies the verdict. Per-entry failures are
    /// logged and skipped; one unreachable query must not starve the
    /// rest of the sweep.
    pub async fn reconcile_pending(
        &self,
        active_window: ChronoDuration,
    ) -> Result<SweepReport, LedgerError> {
        let cutoff = Utc::now() - active_window;
        let stale = self.ledger.list_stale_pending(cutoff).await?;
        let mut report = SweepReport::default();

        for tx in stale {
            if !tx.kind.is_collection() {
                // Payouts settle through the B2C result webhook; there
                // is no query endpoint to poll for them.
                continue;
            }
            let Some(checkout_request_id) = tx.checkout_request_id.clone() else {
                continue;
            };
            report.examined += 1;

            let status = match self.gateway.query_collection(&checkout_request_id).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(
                        transaction_id = %tx.id,
                        error = %err,
                        "Reconciliation query failed, will retry next sweep"
                    );
                    report.failed_queries += 1;
                    continue;
                }
            };

            match self
                .payments
                .apply_query_result(&tx, &status.result_code, &status.result_desc)
                .await
            {
                Ok(updated) if updated.status.is_terminal() => {
                    info!(
                        transaction_id = %updated.id,
                        status = %updated.status,
                        "Reconciled transaction"
                    );
                    report.settled += 1;
                }
                Ok(_) => {}
                // A callback can land between the listing and the
                // transition; the entry is settled either way.
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(err) => {
                    warn!(transaction_id = %tx.id, error = %err, "Reconciliation transition failed");
                }
            }
        }

        Ok(report)
    }

    /// Cancels entries that have been Pending longer than the grace
    /// period. Covers both collections and payouts.
    pub async fn timeout_stale(
        &self,
        grace_period: ChronoDuration,
    ) -> Result<usize, LedgerError> {
        let cutoff = Utc::now() - grace_period;
        let stale = self.ledger.list_stale_pending(cutoff).await?;
        let mut cancelled = 0;

        for tx in stale {
            match self
                .ledger
                .transition(tx.id, TransactionStatus::Cancelled, TIMEOUT_DETAIL, None)
                .await
            {
                Ok(_) => {
                    info!(transaction_id = %tx.id, "Cancelled timed-out transaction");
                    cancelled += 1;
                }
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(err) => {
                    warn!(transaction_id = %tx.id, error = %err, "Timeout cancellation failed");
                }
            }
        }

        Ok(cancelled)
    }
}

/// Background loop for the gateway-query sweep. Runs until the process
/// exits; errors are logged, never fatal.
pub async fn run_reconciler(service: ReconciliationService) {
    info!("Reconciliation sweep started");
    loop {
        sleep(Duration::from_secs(RECONCILE_INTERVAL_SECS)).await;

        match service
            .reconcile_pending(ChronoDuration::minutes(DEFAULT_ACTIVE_WINDOW_MINS))
            .await
        {
            Ok(report) if report.examined > 0 => {
                info!(
                    examined = report.examined,
                    settled = report.settled,
                    failed_queries = report.failed_queries,
                    "Reconciliation sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Reconciliation sweep error: {}", e),
        }
    }
}

/// Background loop for the timeout sweep.
pub async fn run_timeout_sweeper(service: ReconciliationService) {
    info!("Timeout sweep started");
    loop {
        sleep(Duration::from_secs(TIMEOUT_SWEEP_INTERVAL_SECS)).await;

        match service
            .timeout_stale(ChronoDuration::hours(DEFAULT_GRACE_PERIOD_HOURS))
            .await
        {
            Ok(cancelled) if cancelled > 0 => {
                info!(cancelled, "Timeout sweep finished");
            }
            Ok(_) => {}
            Err(e) => error!("Timeout sweep error: {}", e),
        }
    }
}
