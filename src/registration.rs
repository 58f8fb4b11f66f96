//! Store registration.
//!
//! A new store gets a home branch from the resolver, a remote client under
//! that branch's client counter, and a link from the owning user to the
//! remote client.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::branches;
use crate::db::Stores;
use crate::error::{DbContext, SyncError};
use crate::geo::GeoPoint;
use crate::ledger::format_timestamp;
use crate::sequence;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStore {
    pub user_id: i64,
    #[serde(alias = "storeName")]
    pub name: String,
    pub legal_name: Option<String>,
    pub tax_code: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredStore {
    pub store_id: i64,
    pub branch_id: i64,
    pub branch_name: String,
    pub remote_client_id: i64,
    pub client_number: i64,
    pub mobile_key: String,
}

/// Six-digit key handed to the remote client record.
fn mobile_key() -> String {
    format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
}

pub fn register_store(stores: &Stores, new_store: &NewStore) -> Result<RegisteredStore, SyncError> {
    let name = new_store.name.trim();
    if name.is_empty() {
        return Err(SyncError::Validation("store name is required".into()));
    }
    let point = GeoPoint::new(new_store.latitude, new_store.longitude);
    let tax_code = new_store
        .tax_code
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let mut local = stores.local.conn.lock()?;
    let mut remote = stores.remote.conn.lock()?;

    let local_tx = local
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db_context("begin local transaction")?;

    let company_id: i64 = local_tx
        .query_row(
            "SELECT company_id FROM users WHERE id = ?1",
            params![new_store.user_id],
            |row| row.get(0),
        )
        .optional()
        .db_context("load user")?
        .ok_or(SyncError::NotFound {
            entity: "user",
            id: new_store.user_id,
        })?;

    let home = branches::resolve_branch(&local_tx, company_id, point)?;

    let remote_tx = remote
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db_context("begin remote transaction")?;

    let duplicate: Option<i64> = remote_tx
        .query_row(
            "SELECT id FROM crm_clients
             WHERE branch_id = ?1 AND status = 'S'
               AND (trade_name = ?2 OR (?3 IS NOT NULL AND tax_code = ?3))
             LIMIT 1",
            params![home.branch_id, name, tax_code],
            |row| row.get(0),
        )
        .optional()
        .db_context("check remote client")?;
    if duplicate.is_some() {
        return Err(SyncError::Validation(format!(
            "a remote client named {name:?} or with that tax code already exists in branch {}",
            home.branch_id
        )));
    }

    let client_number = sequence::next_client_number(&remote_tx, home.branch_id)?;
    let key = mobile_key();
    remote_tx
        .execute(
            "INSERT INTO crm_clients (branch_id, client_number, status, mobile_key, trade_name, legal_name, tax_code)
             VALUES (?1, ?2, 'S', ?3, ?4, ?5, ?6)",
            params![home.branch_id, client_number, key, name, new_store.legal_name, tax_code],
        )
        .map_err(SyncError::RemoteInsert)?;
    let remote_client_id = remote_tx.last_insert_rowid();

    local_tx
        .execute(
            "UPDATE users SET remote_client_id = ?1 WHERE id = ?2",
            params![remote_client_id, new_store.user_id],
        )
        .db_context("link remote client")?;
    local_tx
        .execute(
            "INSERT INTO stores (user_id, company_id, branch_id, branch_name, name, latitude, longitude, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new_store.user_id,
                company_id,
                home.branch_id,
                home.branch_name,
                name,
                point.lat,
                point.lng,
                format_timestamp(Utc::now()),
            ],
        )
        .db_context("insert store")?;
    let store_id = local_tx.last_insert_rowid();

    remote_tx.commit().map_err(SyncError::RemoteCommit)?;
    local_tx.commit().map_err(|source| {
        error!(
            user_id = new_store.user_id,
            remote_client_id,
            "Remote client committed but local store insert failed: {source}"
        );
        SyncError::Database {
            context: "commit store registration",
            source,
        }
    })?;

    info!(
        store_id,
        user_id = new_store.user_id,
        branch_id = home.branch_id,
        remote_client_id,
        client_number,
        "Store registered"
    );

    Ok(RegisteredStore {
        store_id,
        branch_id: home.branch_id,
        branch_name: home.branch_name,
        remote_client_id,
        client_number,
        mobile_key: key,
    })
}
