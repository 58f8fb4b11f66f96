//! Storefront order backend.
//!
//! Orders placed by registered stores land in the local store database.
//! A background loop copies each pending order into the remote CRM
//! database, allocating per-branch principal ids and keeping the sales
//! aggregates current. Branches are picked by geofence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod background;
pub mod branches;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod orders;
pub mod reconcile;
pub mod registration;
pub mod sequence;
pub mod sync;

pub use config::Config;
pub use error::SyncError;

/// Initialize structured logging (console + rolling file).
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init_logging(config: &Config) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,storefront_sync=debug"));

    let log_dir = diagnostics::get_log_dir(config.log_dir.as_deref());

    // Prune old log files before setting up the appender
    let pruned = diagnostics::prune_old_logs(&log_dir, diagnostics::MAX_LOG_FILES);
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if pruned > 0 {
        info!(pruned, dir = %log_dir.display(), "Pruned old log files");
    }
    guard
}

/// Open both stores, run the sync loop until ctrl-c, then shut it down.
///
/// The loop gets its own pair of connections so a long sweep never blocks
/// the command façade.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        "Starting storefront-sync v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );

    info!(
        local_db = %config.local_db_path.display(),
        remote_db = %config.remote_db_path.display(),
        interval_secs = config.sync_interval_secs,
        backoff_secs = config.sync_backoff_secs,
        actor = %config.sync_actor,
        reconcile_orphans = config.reconcile_orphans,
        delivery_lead_days = config.delivery_lead_days,
        "Configuration loaded"
    );

    let loop_stores = Arc::new(db::Stores::open(&config)?);
    let facade_stores = Arc::new(db::Stores::open(&config)?);
    facade_stores.check_connections()?;

    let sync_state = Arc::new(background::SyncState::new());
    let ctx = commands::AppContext::new(facade_stores, sync_state.clone(), config.clone());
    match commands::diagnostics::sync_health(&ctx) {
        Ok(health) => info!(
            pending = %health["pendingOrders"],
            synced = %health["syncedOrders"],
            "Stores ready"
        ),
        Err(e) => warn!("Could not read sync health at startup: {e}"),
    }

    let token = CancellationToken::new();
    let handle = background::start_sync_loop(
        loop_stores,
        sync_state,
        &config,
        token.clone(),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    token.cancel();
    if let Err(e) = handle.await {
        warn!("Sync loop task ended abnormally: {e}");
    }
    Ok(())
}
