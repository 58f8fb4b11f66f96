//! Diagnostics for the storefront sync service.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: pending/synced counts, schema versions, loop state,
//!   last sweep report and the most recent failed attempts
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::background::{SweepReport, SyncState};
use crate::db::{self, Stores};
use crate::error::{DbContext, SyncError};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "storefront-sync";

const RECENT_FAILURE_LIMIT: i64 = 20;

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentFailure {
    pub order_id: i64,
    pub logged_at: String,
    pub actor: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub pending_orders: i64,
    pub synced_orders: i64,
    pub local_schema_version: i32,
    pub remote_schema_version: i32,
    pub loop_running: bool,
    pub last_sweep: Option<String>,
    pub last_report: Option<SweepReport>,
    pub recent_failures: Vec<RecentFailure>,
}

fn recent_failures(conn: &rusqlite::Connection, limit: i64) -> Result<Vec<RecentFailure>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT order_id, logged_at, actor, detail FROM sync_log
             WHERE outcome = 'FAILED' ORDER BY id DESC LIMIT ?1",
        )
        .db_context("prepare recent failures")?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(RecentFailure {
                order_id: row.get(0)?,
                logged_at: row.get(1)?,
                actor: row.get(2)?,
                detail: row.get(3)?,
            })
        })
        .db_context("query recent failures")?;
    rows.collect::<Result<Vec<_>, _>>()
        .db_context("read recent failures")
}

/// Snapshot for operator dashboards.
pub fn get_sync_health(stores: &Stores, state: &SyncState) -> Result<SyncHealth, SyncError> {
    let (pending_orders, synced_orders, local_schema_version, recent) = {
        let conn = stores.local.conn.lock()?;
        let (pending, synced) = crate::ledger::sync_counts(&conn)?;
        (
            pending,
            synced,
            db::schema_version(&conn)?,
            recent_failures(&conn, RECENT_FAILURE_LIMIT)?,
        )
    };
    let remote_schema_version = {
        let conn = stores.remote.conn.lock()?;
        db::schema_version(&conn)?
    };

    Ok(SyncHealth {
        pending_orders,
        synced_orders,
        local_schema_version,
        remote_schema_version,
        loop_running: state.is_running.load(Ordering::SeqCst),
        last_sweep: state.last_sweep.lock()?.clone(),
        last_report: state.last_report.lock()?.clone(),
        recent_failures: recent,
    })
}

// ---------------------------------------------------------------------------
// Log rotation helpers
// ---------------------------------------------------------------------------

/// Log directory: `configured` when set (`STOREFRONT_LOG_DIR`), otherwise
/// `storefront-sync/logs` under the platform data directory.
pub fn get_log_dir(configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(dir) => dir.to_path_buf(),
        None => platform_data_dir().join(LOG_FILE_PREFIX).join("logs"),
    }
}

fn platform_data_dir() -> PathBuf {
    let var = |key: &str| {
        std::env::var_os(key)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };
    if let Some(dir) = var("LOCALAPPDATA").or_else(|| var("XDG_DATA_HOME")) {
        return dir;
    }
    if cfg!(windows) {
        var("USERPROFILE")
            .unwrap_or_else(|| PathBuf::from("."))
            .join("AppData")
            .join("Local")
    } else {
        var("HOME")
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
    }
}

/// Keep only the newest `keep` log files in `log_dir`. Returns how many
/// files were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
