//! Recovery for partial commits.
//!
//! A remote order whose `order_number` equals a still-unsynced local order's
//! client key (same branch) was committed remotely while the local commit
//! failed. Adopting it marks the local order synced with the existing remote
//! identifiers instead of inserting a duplicate.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::warn;

use crate::db::Stores;
use crate::error::{DbContext, SyncError};
use crate::ledger::{self, format_timestamp, SyncLogEntry, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrphan {
    pub remote_id: i64,
    pub principal_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Adoption {
    pub order_id: i64,
    pub branch_id: i64,
    pub principal_id: i64,
    pub remote_id: i64,
}

/// Remote order on `branch_id` carrying `client_key` as its order number.
pub fn find_remote_orphan(
    remote: &Connection,
    branch_id: i64,
    client_key: &str,
) -> Result<Option<RemoteOrphan>, SyncError> {
    remote
        .query_row(
            "SELECT id, principal_id FROM crm_orders
             WHERE branch_id = ?1 AND order_number = ?2
             ORDER BY id LIMIT 1",
            params![branch_id, client_key],
            |row| {
                Ok(RemoteOrphan {
                    remote_id: row.get(0)?,
                    principal_id: row.get(1)?,
                })
            },
        )
        .optional()
        .db_context("find remote orphan")
}

/// Mark a claimed order synced with an orphan's identifiers.
pub(crate) fn record_adoption(
    local: &Connection,
    order_id: i64,
    actor: &str,
    orphan: &RemoteOrphan,
    now_text: &str,
) -> Result<(), SyncError> {
    ledger::append_log(
        local,
        &SyncLogEntry::new(order_id, actor, SyncOutcome::Reconciled)
            .with_ids(orphan.principal_id, orphan.remote_id)
            .with_detail("adopted existing remote order"),
    );
    ledger::mark_synced(local, order_id, orphan.principal_id, orphan.remote_id, now_text)
}

/// Adopt a remote orphan for `order_id` if one exists.
///
/// Returns `Ok(None)` when the order has no remote counterpart and should
/// go through a normal sync.
pub fn adopt_remote_order(
    stores: &Stores,
    order_id: i64,
    actor: &str,
) -> Result<Option<Adoption>, SyncError> {
    let mut local = stores.local.conn.lock()?;
    let tx = local
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db_context("begin local transaction")?;

    let now_text = format_timestamp(Utc::now());
    ledger::claim_for_sync(&tx, order_id, &now_text)?;

    let (branch_id, client_key): (i64, String) = tx
        .query_row(
            "SELECT branch_id, client_key FROM orders WHERE id = ?1",
            params![order_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .db_context("load order keys")?;

    let orphan = {
        let remote = stores.remote.conn.lock()?;
        find_remote_orphan(&remote, branch_id, &client_key)?
    };
    let Some(orphan) = orphan else {
        return Ok(None);
    };

    record_adoption(&tx, order_id, actor, &orphan, &now_text)?;
    tx.commit().db_context("commit adoption")?;

    warn!(
        order_id,
        branch_id,
        principal_id = orphan.principal_id,
        remote_id = orphan.remote_id,
        "Adopted remote order left by an earlier partial commit"
    );

    Ok(Some(Adoption {
        order_id,
        branch_id,
        principal_id: orphan.principal_id,
        remote_id: orphan.remote_id,
    }))
}
