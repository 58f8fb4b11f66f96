//! Synchronization ledger: the `synced` flag on local orders, the claim
//! taken while a sync attempt runs, and the append-only `sync_log`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DbContext, SyncError};

/// Canonical timestamp layout used in both stores (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOutcome {
    Ok,
    Failed,
    Reconciled,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOutcome::Ok => "OK",
            SyncOutcome::Failed => "FAILED",
            SyncOutcome::Reconciled => "RECONCILED",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "OK" => SyncOutcome::Ok,
            "RECONCILED" => SyncOutcome::Reconciled,
            _ => SyncOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub attempt_id: String,
    pub order_id: i64,
    pub principal_id: Option<i64>,
    pub remote_id: Option<i64>,
    pub logged_at: String,
    pub actor: String,
    pub outcome: SyncOutcome,
    pub detail: Option<String>,
}

impl SyncLogEntry {
    pub fn new(order_id: i64, actor: &str, outcome: SyncOutcome) -> Self {
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            order_id,
            principal_id: None,
            remote_id: None,
            logged_at: format_timestamp(Utc::now()),
            actor: actor.to_string(),
            outcome,
            detail: None,
        }
    }

    pub fn with_ids(mut self, principal_id: i64, remote_id: i64) -> Self {
        self.principal_id = Some(principal_id);
        self.remote_id = Some(remote_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Read probe returned by `verify_sync`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub order_id: i64,
    pub synced: bool,
    pub principal_id: Option<i64>,
    pub remote_id: Option<i64>,
    pub synced_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub order_id: i64,
    pub client_key: String,
    pub created_at: String,
    pub total: f64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: i64,
    pub client_key: String,
    pub branch_id: i64,
    pub status: String,
    pub total: f64,
    pub principal_id: Option<i64>,
    pub remote_id: Option<i64>,
    pub synced_at: Option<String>,
}

/// How a caller identifies an order from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRef {
    RemoteId(i64),
    /// Principal ids repeat across branches; narrow with `branch_id`.
    Principal {
        principal_id: i64,
        branch_id: Option<i64>,
    },
}

pub fn is_synced(conn: &Connection, order_id: i64) -> Result<bool, SyncError> {
    conn.query_row(
        "SELECT COALESCE(synced, 0) FROM orders WHERE id = ?1",
        params![order_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .db_context("read synced flag")?
    .map(|flag| flag != 0)
    .ok_or(SyncError::OrderNotFound(order_id))
}

/// Claim an unsynced order for the current transaction.
///
/// Single conditional update: zero affected rows means the order is gone or
/// already synchronized. Must run inside a write transaction so the claim
/// and the final `mark_synced` are atomic together.
pub fn claim_for_sync(conn: &Connection, order_id: i64, claimed_at: &str) -> Result<(), SyncError> {
    let claimed = conn
        .execute(
            "UPDATE orders SET sync_claimed_at = ?1
             WHERE id = ?2 AND COALESCE(synced, 0) = 0",
            params![claimed_at, order_id],
        )
        .db_context("claim order")?;
    if claimed == 1 {
        return Ok(());
    }
    if is_synced(conn, order_id)? {
        Err(SyncError::AlreadySynchronized(order_id))
    } else {
        // Row exists but the update missed it; treat as lost.
        Err(SyncError::OrderNotFound(order_id))
    }
}

/// Terminal write of a successful sync.
pub fn mark_synced(
    conn: &Connection,
    order_id: i64,
    principal_id: i64,
    remote_id: i64,
    synced_at: &str,
) -> Result<(), SyncError> {
    let updated = conn
        .execute(
            "UPDATE orders
             SET synced = 1, principal_id = ?1, remote_id = ?2, synced_at = ?3,
                 sync_claimed_at = NULL
             WHERE id = ?4",
            params![principal_id, remote_id, synced_at, order_id],
        )
        .db_context("mark synced")?;
    if updated == 0 {
        return Err(SyncError::OrderNotFound(order_id));
    }
    Ok(())
}

pub fn try_append_log(conn: &Connection, entry: &SyncLogEntry) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO sync_log
            (attempt_id, order_id, principal_id, remote_id, logged_at, actor, outcome, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.attempt_id,
            entry.order_id,
            entry.principal_id,
            entry.remote_id,
            entry.logged_at,
            entry.actor,
            entry.outcome.as_str(),
            entry.detail,
        ],
    )
    .db_context("append sync log")?;
    Ok(())
}

/// Best-effort audit append; failures are logged and swallowed.
pub fn append_log(conn: &Connection, entry: &SyncLogEntry) {
    if let Err(e) = try_append_log(conn, entry) {
        warn!(
            order_id = entry.order_id,
            attempt_id = %entry.attempt_id,
            outcome = entry.outcome.as_str(),
            "Failed to append sync log: {e}"
        );
    }
}

/// Audit rows for one order, oldest first.
pub fn sync_history(conn: &Connection, order_id: i64) -> Result<Vec<SyncLogEntry>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT attempt_id, order_id, principal_id, remote_id, logged_at, actor, outcome, detail
             FROM sync_log WHERE order_id = ?1 ORDER BY id",
        )
        .db_context("prepare sync history")?;
    let rows = stmt
        .query_map(params![order_id], |row| {
            Ok(SyncLogEntry {
                attempt_id: row.get(0)?,
                order_id: row.get(1)?,
                principal_id: row.get(2)?,
                remote_id: row.get(3)?,
                logged_at: row.get(4)?,
                actor: row.get(5)?,
                outcome: SyncOutcome::parse(&row.get::<_, String>(6)?),
                detail: row.get(7)?,
            })
        })
        .db_context("query sync history")?;
    rows.collect::<Result<Vec<_>, _>>()
        .db_context("read sync history")
}

pub fn verify_sync(conn: &Connection, order_id: i64) -> Result<SyncStatus, SyncError> {
    conn.query_row(
        "SELECT COALESCE(synced, 0), principal_id, remote_id, synced_at
         FROM orders WHERE id = ?1",
        params![order_id],
        |row| {
            Ok(SyncStatus {
                order_id,
                synced: row.get::<_, i64>(0)? != 0,
                principal_id: row.get(1)?,
                remote_id: row.get(2)?,
                synced_at: row.get(3)?,
            })
        },
    )
    .optional()
    .db_context("verify sync")?
    .ok_or(SyncError::OrderNotFound(order_id))
}

/// Orders with `synced` false or unset, newest first.
pub fn list_pending(conn: &Connection) -> Result<Vec<PendingOrder>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, client_key, created_at, total, status FROM orders
             WHERE synced = 0 OR synced IS NULL
             ORDER BY created_at DESC, id DESC",
        )
        .db_context("prepare pending orders")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PendingOrder {
                order_id: row.get(0)?,
                client_key: row.get(1)?,
                created_at: row.get(2)?,
                total: row.get(3)?,
                status: row.get(4)?,
            })
        })
        .db_context("query pending orders")?;
    rows.collect::<Result<Vec<_>, _>>()
        .db_context("read pending orders")
}

pub fn find_by_remote(conn: &Connection, remote: RemoteRef) -> Result<OrderSummary, SyncError> {
    const COLUMNS: &str = "SELECT id, client_key, branch_id, status, total,
                                  principal_id, remote_id, synced_at FROM orders";
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(OrderSummary {
            order_id: row.get(0)?,
            client_key: row.get(1)?,
            branch_id: row.get(2)?,
            status: row.get(3)?,
            total: row.get(4)?,
            principal_id: row.get(5)?,
            remote_id: row.get(6)?,
            synced_at: row.get(7)?,
        })
    };

    let (found, missing_id) = match remote {
        RemoteRef::RemoteId(remote_id) => (
            conn.query_row(
                &format!("{COLUMNS} WHERE remote_id = ?1 ORDER BY id LIMIT 1"),
                params![remote_id],
                map_row,
            ),
            remote_id,
        ),
        RemoteRef::Principal {
            principal_id,
            branch_id,
        } => (
            conn.query_row(
                &format!(
                    "{COLUMNS} WHERE principal_id = ?1 AND (?2 IS NULL OR branch_id = ?2)
                     ORDER BY id LIMIT 1"
                ),
                params![principal_id, branch_id],
                map_row,
            ),
            principal_id,
        ),
    };

    found
        .optional()
        .db_context("find by remote id")?
        .ok_or(SyncError::NotFound {
            entity: "remote order",
            id: missing_id,
        })
}

/// Move synced orders still marked `pending` to `processing`.
pub fn advance_synced_pending(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute(
        "UPDATE orders SET status = 'processing' WHERE synced = 1 AND status = 'pending'",
        [],
    )
    .db_context("advance synced orders")
}

/// `(pending, synced)` order counts.
pub fn sync_counts(conn: &Connection) -> Result<(i64, i64), SyncError> {
    conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN COALESCE(synced, 0) = 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0)
         FROM orders",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .db_context("count orders")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Stores;

    pub(crate) fn insert_order(conn: &Connection, client_key: &str, created_at: &str) -> i64 {
        conn.execute(
            "INSERT INTO orders (client_key, user_id, store_id, branch_id, created_at, total)
             VALUES (?1, 1, 1, 1, ?2, 10.0)",
            params![client_key, created_at],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_is_synced_and_mark_synced() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let id = insert_order(&conn, "k1", "2026-01-01 10:00:00");

        assert!(!is_synced(&conn, id).unwrap());
        mark_synced(&conn, id, 4, 900, "2026-01-01 10:05:00").unwrap();
        assert!(is_synced(&conn, id).unwrap());

        let status = verify_sync(&conn, id).unwrap();
        assert!(status.synced);
        assert_eq!(status.principal_id, Some(4));
        assert_eq!(status.remote_id, Some(900));
        assert_eq!(status.synced_at.as_deref(), Some("2026-01-01 10:05:00"));
    }

    #[test]
    fn test_missing_order_is_not_found() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        assert!(matches!(is_synced(&conn, 42), Err(SyncError::OrderNotFound(42))));
        assert!(matches!(verify_sync(&conn, 42), Err(SyncError::OrderNotFound(42))));
        assert!(matches!(
            claim_for_sync(&conn, 42, "now"),
            Err(SyncError::OrderNotFound(42))
        ));
        assert!(matches!(
            mark_synced(&conn, 42, 1, 1, "now"),
            Err(SyncError::OrderNotFound(42))
        ));
    }

    #[test]
    fn test_claim_refuses_synced_order() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let id = insert_order(&conn, "k1", "2026-01-01 10:00:00");

        claim_for_sync(&conn, id, "2026-01-01 10:01:00").unwrap();
        // A second claim of an unsynced order is allowed; the write lock
        // held by the surrounding transaction is what serializes attempts.
        claim_for_sync(&conn, id, "2026-01-01 10:02:00").unwrap();

        mark_synced(&conn, id, 1, 1, "2026-01-01 10:03:00").unwrap();
        assert!(matches!(
            claim_for_sync(&conn, id, "2026-01-01 10:04:00"),
            Err(SyncError::AlreadySynchronized(_))
        ));
        let claimed: Option<String> = conn
            .query_row("SELECT sync_claimed_at FROM orders WHERE id = ?1", [id], |r| r.get(0))
            .unwrap();
        assert!(claimed.is_none(), "mark_synced clears the claim");
    }

    #[test]
    fn test_append_log_and_history() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let id = insert_order(&conn, "k1", "2026-01-01 10:00:00");

        append_log(
            &conn,
            &SyncLogEntry::new(id, "admin", SyncOutcome::Failed).with_detail("boom"),
        );
        append_log(
            &conn,
            &SyncLogEntry::new(id, "admin", SyncOutcome::Ok).with_ids(1, 77),
        );

        let history = sync_history(&conn, id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, SyncOutcome::Failed);
        assert_eq!(history[0].detail.as_deref(), Some("boom"));
        assert_eq!(history[1].outcome, SyncOutcome::Ok);
        assert_eq!(history[1].remote_id, Some(77));
        assert_ne!(history[0].attempt_id, history[1].attempt_id);
    }

    #[test]
    fn test_append_log_failure_is_swallowed() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        conn.execute_batch("DROP TABLE sync_log").unwrap();
        append_log(&conn, &SyncLogEntry::new(1, "admin", SyncOutcome::Ok));
        assert!(try_append_log(&conn, &SyncLogEntry::new(1, "admin", SyncOutcome::Ok)).is_err());
    }

    #[test]
    fn test_list_pending_newest_first() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let old = insert_order(&conn, "old", "2026-01-01 08:00:00");
        let new = insert_order(&conn, "new", "2026-01-02 08:00:00");
        let done = insert_order(&conn, "done", "2026-01-03 08:00:00");
        conn.execute("UPDATE orders SET synced = 0 WHERE id = ?1", [old])
            .unwrap();
        mark_synced(&conn, done, 1, 1, "2026-01-03 08:01:00").unwrap();

        let pending = list_pending(&conn).unwrap();
        let ids: Vec<i64> = pending.iter().map(|p| p.order_id).collect();
        assert_eq!(ids, vec![new, old]);
        assert_eq!(pending[0].client_key, "new");
        assert_eq!(pending[0].status, "pending");
    }

    #[test]
    fn test_find_by_remote() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let id = insert_order(&conn, "k1", "2026-01-01 10:00:00");
        mark_synced(&conn, id, 5, 321, "2026-01-01 10:05:00").unwrap();

        let by_remote = find_by_remote(&conn, RemoteRef::RemoteId(321)).unwrap();
        assert_eq!(by_remote.order_id, id);

        let by_principal = find_by_remote(
            &conn,
            RemoteRef::Principal {
                principal_id: 5,
                branch_id: Some(1),
            },
        )
        .unwrap();
        assert_eq!(by_principal.order_id, id);

        let wrong_branch = find_by_remote(
            &conn,
            RemoteRef::Principal {
                principal_id: 5,
                branch_id: Some(2),
            },
        );
        assert!(matches!(wrong_branch, Err(SyncError::NotFound { .. })));
    }

    #[test]
    fn test_advance_synced_pending_is_idempotent() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.local.conn.lock().unwrap();
        let a = insert_order(&conn, "a", "2026-01-01 10:00:00");
        let _b = insert_order(&conn, "b", "2026-01-01 10:00:00");
        mark_synced(&conn, a, 1, 1, "2026-01-01 10:05:00").unwrap();

        assert_eq!(advance_synced_pending(&conn).unwrap(), 1);
        assert_eq!(advance_synced_pending(&conn).unwrap(), 0);
        let status: String = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", [a], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "processing");
        assert_eq!(sync_counts(&conn).unwrap(), (1, 1));
    }
}
