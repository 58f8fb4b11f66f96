//! Background synchronization loop.
//!
//! One tokio task sweeps all unsynced orders, advances synced `pending`
//! orders to `processing`, then sleeps. Database work runs on the blocking
//! pool. Cancellation only interrupts the sleep, so a sweep in progress
//! always finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Stores;
use crate::error::SyncError;
use crate::ledger;
use crate::reconcile;
use crate::sync::{self, SyncRequest};

/// Per-sweep settings, taken from `Config`.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub actor: String,
    pub reconcile_orphans: bool,
    pub delivery_lead_days: i64,
}

impl SweepOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            actor: config.sync_actor.clone(),
            reconcile_orphans: config.reconcile_orphans,
            delivery_lead_days: config.delivery_lead_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub order_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub started_at: String,
    pub pending: usize,
    pub synced: usize,
    pub reconciled: usize,
    pub failures: Vec<SweepFailure>,
    /// Orders moved from `pending` to `processing` after the sweep.
    pub advanced: usize,
}

/// Shared state of the loop, readable by the request façade.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sweep: Arc<Mutex<Option<String>>>,
    pub last_report: Arc<Mutex<Option<SweepReport>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sweep: Arc::new(Mutex::new(None)),
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    fn record(&self, report: &SweepReport) {
        if let Ok(mut guard) = self.last_sweep.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        if let Ok(mut guard) = self.last_report.lock() {
            *guard = Some(report.clone());
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sweep every unsynced order once.
///
/// Fails only when the pending list itself cannot be read; individual
/// order failures are collected in the report.
pub fn run_sweep(stores: &Stores, options: &SweepOptions) -> Result<SweepReport, SyncError> {
    let pending = {
        let conn = stores.local.conn.lock()?;
        ledger::list_pending(&conn)?
    };

    let mut report = SweepReport {
        started_at: Utc::now().to_rfc3339(),
        pending: pending.len(),
        ..SweepReport::default()
    };

    for order in &pending {
        let order_id = order.order_id;

        if options.reconcile_orphans {
            match reconcile::adopt_remote_order(stores, order_id, &options.actor) {
                Ok(Some(_)) => {
                    report.reconciled += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(order_id, "Orphan check failed: {e}");
                    report.failures.push(SweepFailure {
                        order_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            }
        }

        let req = SyncRequest::new(order_id, options.actor.as_str())
            .with_lead_days(options.delivery_lead_days)
            .with_reconcile(options.reconcile_orphans);
        match sync::sync_order(stores, &req) {
            Ok(receipt) if receipt.reconciled => report.reconciled += 1,
            Ok(_) => report.synced += 1,
            Err(e) => report.failures.push(SweepFailure {
                order_id,
                error: e.to_string(),
            }),
        }
    }

    report.advanced = match stores.local.conn.lock() {
        Ok(conn) => ledger::advance_synced_pending(&conn).unwrap_or_else(|e| {
            warn!("Status advance failed: {e}");
            0
        }),
        Err(e) => {
            warn!("Status advance skipped: {e}");
            0
        }
    };

    if report.pending > 0 || report.advanced > 0 {
        info!(
            pending = report.pending,
            synced = report.synced,
            reconciled = report.reconciled,
            failed = report.failures.len(),
            advanced = report.advanced,
            "Sync sweep complete"
        );
    } else {
        debug!("Sync sweep found nothing to do");
    }

    Ok(report)
}

async fn sweep_blocking(stores: Arc<Stores>, options: SweepOptions) -> Result<SweepReport, SyncError> {
    tokio::task::spawn_blocking(move || run_sweep(&stores, &options))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

/// Start the background loop. Returns the task handle; cancel `token` to
/// stop it after the current sweep.
pub fn start_sync_loop(
    stores: Arc<Stores>,
    sync_state: Arc<SyncState>,
    config: &Config,
    token: CancellationToken,
) -> JoinHandle<()> {
    let options = SweepOptions::from_config(config);
    let interval = Duration::from_secs(config.sync_interval_secs);
    let backoff = Duration::from_secs(config.sync_backoff_secs);

    sync_state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!(
            "Sync loop started (interval: {}s, backoff: {}s)",
            interval.as_secs(),
            backoff.as_secs()
        );

        loop {
            let pause = match sweep_blocking(stores.clone(), options.clone()).await {
                Ok(report) => {
                    sync_state.record(&report);
                    interval
                }
                Err(e @ SyncError::Task(_)) => {
                    error!("Sync sweep aborted: {e}");
                    backoff
                }
                Err(e) => {
                    warn!("Sync sweep failed, backing off: {e}");
                    backoff
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        sync_state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

/// Run one sweep now, outside the loop's schedule.
pub async fn force_sweep(
    stores: Arc<Stores>,
    sync_state: &SyncState,
    options: SweepOptions,
) -> Result<SweepReport, SyncError> {
    let report = sweep_blocking(stores, options).await?;
    sync_state.record(&report);
    info!(
        synced = report.synced,
        failed = report.failures.len(),
        "Forced sweep complete"
    );
    Ok(report)
}
