//! Order synchronization transaction.
//!
//! Copies one local order and its lines into the remote store. Both stores
//! get their own transaction; the remote one commits first, the local one
//! second. A local commit failure after a remote commit is a partial commit
//! and is logged at error level with the remote identifiers.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::Stores;
use crate::error::{DbContext, SyncError};
use crate::ledger::{self, format_timestamp, SyncLogEntry, SyncOutcome, TIMESTAMP_FORMAT};
use crate::reconcile;
use crate::sequence;

pub const DEFAULT_DELIVERY_LEAD_DAYS: i64 = 2;

/// Display name used when the ordering user cannot be loaded.
const FALLBACK_CLIENT_NAME: &str = "Client";
const REMOTE_ORDER_COMMENT: &str = "Order from the web store";
const REMOTE_ORDER_CONTACT: &str = "Store sale";

/// Accepted delivery date layouts, tried in order. All are read as UTC.
const DELIVERY_DATE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S", TIMESTAMP_FORMAT];

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub order_id: i64,
    /// When set, must match the order's stored branch.
    pub branch_id: Option<i64>,
    /// When set, must match the order's stored client key.
    pub client_key: Option<String>,
    pub actor: String,
    pub delivery_lead_days: i64,
    /// Adopt a remote order left by an earlier partial commit instead of
    /// inserting a second one.
    pub reconcile_orphans: bool,
}

impl SyncRequest {
    pub fn new(order_id: i64, actor: impl Into<String>) -> Self {
        Self {
            order_id,
            branch_id: None,
            client_key: None,
            actor: actor.into(),
            delivery_lead_days: DEFAULT_DELIVERY_LEAD_DAYS,
            reconcile_orphans: true,
        }
    }

    pub fn with_lead_days(mut self, days: i64) -> Self {
        self.delivery_lead_days = days;
        self
    }

    pub fn with_reconcile(mut self, enabled: bool) -> Self {
        self.reconcile_orphans = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReceipt {
    pub order_id: i64,
    pub branch_id: i64,
    pub principal_id: i64,
    pub remote_id: i64,
    pub line_count: usize,
    pub synced_at: String,
    /// The remote order already existed and was adopted.
    pub reconciled: bool,
}

/// Local order columns needed by the remote insert.
#[derive(Debug, Clone)]
struct LocalOrder {
    id: i64,
    client_key: String,
    user_id: i64,
    branch_id: i64,
    delivery_date: Option<String>,
    discount: f64,
    tax_general: f64,
    tax_special: f64,
    total: f64,
    payment_method_id: i64,
    origin: String,
    price_list_id: i64,
}

#[derive(Debug, Clone)]
struct LocalLine {
    product_id: i64,
    description: String,
    quantity: f64,
    unit_price: f64,
    tax_general: f64,
    tax_special: f64,
}

/// Unit-level pricing stored on remote lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitPricing {
    pub net: f64,
    pub tax_general: f64,
    pub tax_special: f64,
}

impl UnitPricing {
    /// Split line tax totals into per-unit amounts. A non-positive
    /// quantity yields zero unit taxes.
    pub fn from_line(unit_net: f64, quantity: f64, line_tax_general: f64, line_tax_special: f64) -> Self {
        let (tax_general, tax_special) = if quantity > 0.0 {
            (line_tax_general / quantity, line_tax_special / quantity)
        } else {
            (0.0, 0.0)
        };
        Self {
            net: unit_net,
            tax_general,
            tax_special,
        }
    }

    pub fn with_tax(&self) -> f64 {
        self.net + self.tax_general + self.tax_special
    }
}

/// Remote channel flags `(web_mobile, phone_in_person)` for an origin tag.
pub fn channel_flags(origin: &str) -> (bool, bool) {
    match origin.trim().to_ascii_lowercase().as_str() {
        "web" | "mobile" => (true, false),
        "phone" | "in-person" | "in_person" => (false, true),
        _ => (false, false),
    }
}

/// Opaque remote order key.
pub fn order_key(branch_id: i64, client_key: &str, now: DateTime<Utc>) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{branch_id}{client_key}{}", now.timestamp_nanos_opt().unwrap_or_default()))
    )
}

/// Opaque remote client key.
pub fn client_key_hash(order_id: i64, client_key: &str, now: DateTime<Utc>) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{order_id}{client_key}{}", now.timestamp_nanos_opt().unwrap_or_default()))
    )
}

pub fn parse_delivery_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DELIVERY_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Canonical delivery date for a stored value; missing or unreadable
/// values become `now + lead_days`.
pub fn resolve_delivery_date(stored: Option<&str>, now: DateTime<Utc>, lead_days: i64) -> String {
    match stored.filter(|s| !s.trim().is_empty()) {
        Some(raw) => match parse_delivery_date(raw) {
            Some(at) => format_timestamp(at),
            None => {
                warn!("Unreadable delivery date {raw:?}, using default lead time");
                format_timestamp(now + Duration::days(lead_days))
            }
        },
        None => format_timestamp(now + Duration::days(lead_days)),
    }
}

fn load_order(conn: &Connection, order_id: i64) -> Result<LocalOrder, SyncError> {
    conn.query_row(
        "SELECT id, client_key, user_id, branch_id, delivery_date, discount,
                tax_general, tax_special, total, payment_method_id, origin, price_list_id
         FROM orders WHERE id = ?1",
        params![order_id],
        |row| {
            Ok(LocalOrder {
                id: row.get(0)?,
                client_key: row.get(1)?,
                user_id: row.get(2)?,
                branch_id: row.get(3)?,
                delivery_date: row.get(4)?,
                discount: row.get(5)?,
                tax_general: row.get(6)?,
                tax_special: row.get(7)?,
                total: row.get(8)?,
                payment_method_id: row.get(9)?,
                origin: row.get(10)?,
                price_list_id: row.get(11)?,
            })
        },
    )
    .optional()
    .db_context("load order")?
    .ok_or(SyncError::OrderNotFound(order_id))
}

fn ensure_branch(conn: &Connection, branch_id: i64) -> Result<(), SyncError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM branches WHERE id = ?1",
            params![branch_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .db_context("check branch")?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(SyncError::NotFound {
            entity: "branch",
            id: branch_id,
        })
    }
}

fn load_lines(conn: &Connection, order_id: i64) -> Result<Vec<LocalLine>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT product_id, description, quantity, unit_price, tax_general, tax_special
             FROM order_items WHERE order_id = ?1 ORDER BY id",
        )
        .db_context("prepare order items")?;
    let rows = stmt
        .query_map(params![order_id], |row| {
            Ok(LocalLine {
                product_id: row.get(0)?,
                description: row.get(1)?,
                quantity: row.get(2)?,
                unit_price: row.get(3)?,
                tax_general: row.get(4)?,
                tax_special: row.get(5)?,
            })
        })
        .db_context("query order items")?;
    rows.collect::<Result<Vec<_>, _>>()
        .db_context("read order items")
}

/// Display name and remote client id of the ordering user. Never fails.
fn load_client(conn: &Connection, user_id: i64) -> (String, i64) {
    let found = conn
        .query_row(
            "SELECT full_name, remote_client_id FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
        )
        .optional();
    match found {
        Ok(Some((name, remote_client_id))) if !name.trim().is_empty() => {
            (name, remote_client_id.unwrap_or(0))
        }
        Ok(Some((_, remote_client_id))) => {
            (FALLBACK_CLIENT_NAME.to_string(), remote_client_id.unwrap_or(0))
        }
        Ok(None) => {
            warn!(user_id, "Ordering user not found, using fallback client name");
            (FALLBACK_CLIENT_NAME.to_string(), 0)
        }
        Err(e) => {
            warn!(user_id, "User lookup failed, using fallback client name: {e}");
            (FALLBACK_CLIENT_NAME.to_string(), 0)
        }
    }
}

/// Increment the per-line sales occurrence counters.
///
/// Each line adds 1 regardless of its quantity; these are not unit sales.
fn bump_sales_counters(
    conn: &Connection,
    branch_id: i64,
    product_ids: impl Iterator<Item = i64>,
    now: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    let day = now.format("%Y-%m-%d").to_string();
    let month = now.format("%Y-%m-01").to_string();
    let mut by_day = conn.prepare_cached(
        "INSERT INTO sales_by_product_day (branch_id, product_id, day, count)
         VALUES (?1, ?2, ?3, 1)
         ON CONFLICT(branch_id, product_id, day) DO UPDATE SET count = count + 1",
    )?;
    let mut by_month = conn.prepare_cached(
        "INSERT INTO sales_by_product_month (branch_id, product_id, month, count)
         VALUES (?1, ?2, ?3, 1)
         ON CONFLICT(branch_id, product_id, month) DO UPDATE SET count = count + 1",
    )?;
    for product_id in product_ids {
        by_day.execute(params![branch_id, product_id, day])?;
        by_month.execute(params![branch_id, product_id, month])?;
    }
    Ok(())
}

/// Synchronize one local order into the remote store.
///
/// On failure a `FAILED` row is appended to the sync log after both
/// transactions have rolled back.
pub fn sync_order(stores: &Stores, req: &SyncRequest) -> Result<SyncReceipt, SyncError> {
    let result = run_sync(stores, req);

    match &result {
        Ok(receipt) => info!(
            order_id = receipt.order_id,
            branch_id = receipt.branch_id,
            principal_id = receipt.principal_id,
            remote_id = receipt.remote_id,
            actor = %req.actor,
            "Order synchronized"
        ),
        Err(e) => {
            warn!(order_id = req.order_id, actor = %req.actor, "Order sync failed: {e}");
            record_failure(stores, req, e);
        }
    }

    result
}

/// Convenience wrapper for callers that only know the order id.
pub fn sync_order_by_id(stores: &Stores, order_id: i64, actor: &str) -> Result<SyncReceipt, SyncError> {
    sync_order(stores, &SyncRequest::new(order_id, actor))
}

fn record_failure(stores: &Stores, req: &SyncRequest, err: &SyncError) {
    let conn = match stores.local.conn.lock() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(order_id = req.order_id, "Cannot record failed sync attempt: {e}");
            return;
        }
    };
    let mut entry = SyncLogEntry::new(req.order_id, &req.actor, SyncOutcome::Failed)
        .with_detail(format!("{}: {err}", err.tag()));
    if let SyncError::LocalCommit {
        principal_id,
        remote_id,
        ..
    } = err
    {
        entry = entry.with_ids(*principal_id, *remote_id);
    }
    ledger::append_log(&conn, &entry);
}

fn run_sync(stores: &Stores, req: &SyncRequest) -> Result<SyncReceipt, SyncError> {
    let mut local = stores.local.conn.lock()?;
    let mut remote = stores.remote.conn.lock()?;

    let local_tx = local
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db_context("begin local transaction")?;

    let now = Utc::now();
    let now_text = format_timestamp(now);

    ledger::claim_for_sync(&local_tx, req.order_id, &now_text)?;

    let order = load_order(&local_tx, req.order_id)?;
    if let Some(branch_id) = req.branch_id.filter(|b| *b != order.branch_id) {
        return Err(SyncError::Validation(format!(
            "order {} belongs to branch {}, not {branch_id}",
            order.id, order.branch_id
        )));
    }
    if let Some(key) = req.client_key.as_deref().filter(|k| *k != order.client_key) {
        return Err(SyncError::Validation(format!(
            "client key {key:?} does not match order {}",
            order.id
        )));
    }

    ensure_branch(&local_tx, order.branch_id)?;

    let lines = load_lines(&local_tx, order.id)?;
    let delivery_date = resolve_delivery_date(order.delivery_date.as_deref(), now, req.delivery_lead_days);
    let (client_name, remote_client_id) = load_client(&local_tx, order.user_id);

    let remote_tx = remote
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db_context("begin remote transaction")?;

    if req.reconcile_orphans {
        if let Some(orphan) = reconcile::find_remote_orphan(&remote_tx, order.branch_id, &order.client_key)? {
            drop(remote_tx);
            reconcile::record_adoption(&local_tx, order.id, &req.actor, &orphan, &now_text)?;
            local_tx.commit().db_context("commit adoption")?;
            warn!(
                order_id = order.id,
                branch_id = order.branch_id,
                principal_id = orphan.principal_id,
                remote_id = orphan.remote_id,
                "Adopted remote order left by an earlier partial commit"
            );
            return Ok(SyncReceipt {
                order_id: order.id,
                branch_id: order.branch_id,
                principal_id: orphan.principal_id,
                remote_id: orphan.remote_id,
                line_count: lines.len(),
                synced_at: now_text,
                reconciled: true,
            });
        }
    }

    let principal_id = sequence::next_order_principal(&remote_tx, order.branch_id)?;
    let remote_order_key = order_key(order.branch_id, &order.client_key, now);
    let remote_client_key = client_key_hash(order.id, &order.client_key, now);
    let (web_mobile, phone_in_person) = channel_flags(&order.origin);

    remote_tx
        .execute(
            "INSERT INTO crm_orders (
                principal_id, order_key, status, delivery_date, created_at,
                updated_at, delivered_at, comments, client_key, client_name,
                contact, amount, tax_general, tax_special, discount,
                invoice, price_list_id, payment_method_id, order_number, line_count,
                web_mobile, phone_in_person, branch_id, client_id
            ) VALUES (?1, ?2, 'N', ?3, ?4, ?4, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      'N', ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                principal_id,
                remote_order_key,
                delivery_date,
                now_text,
                REMOTE_ORDER_COMMENT,
                remote_client_key,
                client_name,
                REMOTE_ORDER_CONTACT,
                order.total,
                order.tax_general,
                order.tax_special,
                order.discount,
                order.price_list_id,
                order.payment_method_id,
                order.client_key,
                lines.len() as i64,
                web_mobile,
                phone_in_person,
                order.branch_id,
                remote_client_id,
            ],
        )
        .map_err(SyncError::RemoteInsert)?;

    let remote_id = match remote_tx.last_insert_rowid() {
        id if id > 0 => id,
        _ => lookup_remote_id(&remote_tx, principal_id, order.branch_id),
    };

    {
        let mut insert_line = remote_tx
            .prepare_cached(
                "INSERT INTO crm_order_items (
                    order_id, product_id, ordinal, description,
                    price, quantity, net_price, tax_general, tax_special
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .map_err(SyncError::RemoteInsert)?;
        for (idx, line) in lines.iter().enumerate() {
            let ordinal = idx + 1;
            let unit = UnitPricing::from_line(line.unit_price, line.quantity, line.tax_general, line.tax_special);
            insert_line
                .execute(params![
                    remote_id,
                    line.product_id,
                    ordinal as i64,
                    line.description,
                    unit.with_tax(),
                    line.quantity,
                    unit.net,
                    unit.tax_general,
                    unit.tax_special,
                ])
                .map_err(|source| SyncError::DetailInsert { ordinal, source })?;
        }
    }

    bump_sales_counters(&remote_tx, order.branch_id, lines.iter().map(|l| l.product_id), now)
        .map_err(SyncError::RemoteInsert)?;

    ledger::append_log(
        &local_tx,
        &SyncLogEntry::new(order.id, &req.actor, SyncOutcome::Ok).with_ids(principal_id, remote_id),
    );
    ledger::mark_synced(&local_tx, order.id, principal_id, remote_id, &now_text)?;

    remote_tx.commit().map_err(SyncError::RemoteCommit)?;
    local_tx.commit().map_err(|source| {
        error!(
            order_id = order.id,
            branch_id = order.branch_id,
            principal_id,
            remote_id,
            "Remote order committed but local commit failed; manual reconciliation required: {source}"
        );
        SyncError::LocalCommit {
            order_id: order.id,
            principal_id,
            remote_id,
            source,
        }
    })?;

    Ok(SyncReceipt {
        order_id: order.id,
        branch_id: order.branch_id,
        principal_id,
        remote_id,
        line_count: lines.len(),
        synced_at: now_text,
        reconciled: false,
    })
}

/// Fallback when the driver did not surface the inserted row id.
fn lookup_remote_id(conn: &Connection, principal_id: i64, branch_id: i64) -> i64 {
    match conn
        .query_row(
            "SELECT id FROM crm_orders WHERE principal_id = ?1 AND branch_id = ?2",
            params![principal_id, branch_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
    {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(principal_id, branch_id, "Remote order id unavailable, recording 0");
            0
        }
        Err(e) => {
            warn!(principal_id, branch_id, "Remote order id lookup failed, recording 0: {e}");
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryDateUpdate {
    pub order_id: i64,
    pub delivery_date: String,
    pub synced: bool,
    pub principal_id: Option<i64>,
    pub remote_id: Option<i64>,
    /// `false` when the order is synced but the remote patch failed.
    pub remote_updated: bool,
}

/// Change an order's delivery date; synced orders also get a best-effort
/// patch of their remote row.
pub fn update_delivery_date(
    stores: &Stores,
    order_id: i64,
    raw_date: &str,
) -> Result<DeliveryDateUpdate, SyncError> {
    let parsed = parse_delivery_date(raw_date)
        .ok_or_else(|| SyncError::Validation(format!("unrecognized delivery date {raw_date:?}")))?;
    let delivery_date = format_timestamp(parsed);

    let mut local = stores.local.conn.lock()?;
    let tx = local.transaction().db_context("begin local transaction")?;
    let updated = tx
        .execute(
            "UPDATE orders SET delivery_date = ?1 WHERE id = ?2",
            params![delivery_date, order_id],
        )
        .db_context("update delivery date")?;
    if updated == 0 {
        return Err(SyncError::OrderNotFound(order_id));
    }
    let status = ledger::verify_sync(&tx, order_id)?;

    let mut remote_updated = false;
    if let (true, Some(remote_id)) = (status.synced, status.remote_id) {
        remote_updated = patch_remote_delivery_date(stores, remote_id, &delivery_date);
    }

    tx.commit().db_context("commit delivery date")?;
    info!(order_id, delivery_date = %delivery_date, remote_updated, "Delivery date updated");

    Ok(DeliveryDateUpdate {
        order_id,
        delivery_date,
        synced: status.synced,
        principal_id: status.principal_id,
        remote_id: status.remote_id,
        remote_updated,
    })
}

fn patch_remote_delivery_date(stores: &Stores, remote_id: i64, delivery_date: &str) -> bool {
    let now_text = format_timestamp(Utc::now());
    let outcome = stores.remote.conn.lock().map_err(SyncError::from).and_then(|conn| {
        conn.execute(
            "UPDATE crm_orders SET delivery_date = ?1, updated_at = ?2, delivered_at = ?2
             WHERE id = ?3",
            params![delivery_date, now_text, remote_id],
        )
        .db_context("patch remote delivery date")
    });
    match outcome {
        Ok(n) if n > 0 => true,
        Ok(_) => {
            warn!(remote_id, "Remote order missing, delivery date not propagated");
            false
        }
        Err(e) => {
            warn!(remote_id, "Failed to propagate delivery date: {e}");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::SyncOutcome;
    use chrono::TimeZone;

    pub(crate) fn seed_user(conn: &Connection, id: i64, name: &str, remote_client_id: Option<i64>) {
        conn.execute(
            "INSERT INTO users (id, company_id, full_name, remote_client_id) VALUES (?1, 1, ?2, ?3)",
            params![id, name, remote_client_id],
        )
        .unwrap();
    }

    /// Insert an order with two lines: 2 x 100.00 (tax 32 + 6) and 3 x 10.50 (tax 5.04 + 0).
    pub(crate) fn seed_order(conn: &Connection, client_key: &str, branch_id: i64, user_id: i64) -> i64 {
        conn.execute(
            "INSERT OR IGNORE INTO branches (id, company_id, name) VALUES (?1, 1, 'Centro')",
            params![branch_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO orders (client_key, user_id, store_id, branch_id, created_at,
                                 subtotal, tax_general, tax_special, total, origin)
             VALUES (?1, ?2, 1, ?3, '2026-03-01 09:00:00', 231.5, 37.04, 6.0, 274.54, 'web')",
            params![client_key, user_id, branch_id],
        )
        .unwrap();
        let order_id = conn.last_insert_rowid();
        for (product_id, qty, price, tax_g, tax_s) in
            [(501_i64, 2.0, 100.0, 32.0, 6.0), (502, 3.0, 10.5, 5.04, 0.0)]
        {
            conn.execute(
                "INSERT INTO order_items (order_id, product_id, description, quantity, unit_price,
                                          subtotal, tax_general, tax_special, total)
                 VALUES (?1, ?2, 'item', ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    order_id,
                    product_id,
                    qty,
                    price,
                    qty * price,
                    tax_g,
                    tax_s,
                    qty * price + tax_g + tax_s
                ],
            )
            .unwrap();
        }
        order_id
    }

    fn remote_count(stores: &Stores, table: &str) -> i64 {
        let conn = stores.remote.conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_principal_ids_follow_branch_sequence() {
        let stores = Stores::open_in_memory().unwrap();
        let (o1, o2) = {
            let conn = stores.local.conn.lock().unwrap();
            seed_user(&conn, 1, "Ana Pech", Some(55));
            (seed_order(&conn, "o1", 1, 1), seed_order(&conn, "o2", 1, 1))
        };

        let first = sync_order_by_id(&stores, o1, "admin").unwrap();
        let second = sync_order_by_id(&stores, o2, "admin").unwrap();
        assert_eq!(first.principal_id, 1);
        assert_eq!(second.principal_id, 2);
        assert!(first.remote_id > 0);
        assert_ne!(first.remote_id, second.remote_id);
        assert_eq!(first.line_count, 2);

        let local = stores.local.conn.lock().unwrap();
        let status = ledger::verify_sync(&local, o1).unwrap();
        assert!(status.synced);
        assert_eq!(status.principal_id, Some(1));
        assert_eq!(status.remote_id, Some(first.remote_id));
    }

    #[test]
    fn test_second_sync_is_rejected_without_new_sequence() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_user(&conn, 1, "Ana Pech", None);
            seed_order(&conn, "o1", 4, 1)
        };

        sync_order_by_id(&stores, order_id, "admin").unwrap();
        let err = sync_order_by_id(&stores, order_id, "admin").unwrap_err();
        assert!(matches!(err, SyncError::AlreadySynchronized(id) if id == order_id));
        assert!(err.to_string().contains("already synchronized"));

        {
            let remote = stores.remote.conn.lock().unwrap();
            assert_eq!(sequence::current_order_principal(&remote, 4).unwrap(), 1);
        }
        assert_eq!(remote_count(&stores, "crm_orders"), 1);

        let local = stores.local.conn.lock().unwrap();
        let history = ledger::sync_history(&local, order_id).unwrap();
        let outcomes: Vec<SyncOutcome> = history.iter().map(|h| h.outcome).collect();
        assert_eq!(outcomes, vec![SyncOutcome::Ok, SyncOutcome::Failed]);
    }

    #[test]
    fn test_remote_lines_store_unit_amounts() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_user(&conn, 1, "Ana Pech", None);
            seed_order(&conn, "o1", 1, 1)
        };
        let receipt = sync_order_by_id(&stores, order_id, "admin").unwrap();

        let remote = stores.remote.conn.lock().unwrap();
        let mut stmt = remote
            .prepare(
                "SELECT ordinal, product_id, price, net_price, tax_general, tax_special
                 FROM crm_order_items WHERE order_id = ?1 ORDER BY ordinal",
            )
            .unwrap();
        let rows: Vec<(i64, i64, f64, f64, f64, f64)> = stmt
            .query_map([receipt.remote_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].0, rows[0].1), (1, 501));
        assert_eq!((rows[1].0, rows[1].1), (2, 502));
        // 100 + 32/2 + 6/2
        assert!((rows[0].2 - 119.0).abs() < 1e-6);
        assert!((rows[0].4 - 16.0).abs() < 1e-6);
        assert!((rows[0].5 - 3.0).abs() < 1e-6);
        for (_, _, price, net, tax_g, tax_s) in rows {
            assert!((net + tax_g + tax_s - price).abs() < 1e-6);
        }
    }

    #[test]
    fn test_remote_header_fields() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_user(&conn, 1, "Ana Pech", Some(88));
            let id = seed_order(&conn, "o1", 1, 1);
            conn.execute(
                "UPDATE orders SET origin = 'phone', delivery_date = '2026-03-05T14:30:00Z' WHERE id = ?1",
                [id],
            )
            .unwrap();
            id
        };
        let receipt = sync_order_by_id(&stores, order_id, "admin").unwrap();

        let remote = stores.remote.conn.lock().unwrap();
        let (status, name, client_id, order_number, lines, web, phone, delivery): (
            String,
            String,
            i64,
            String,
            i64,
            bool,
            bool,
            String,
        ) = remote
            .query_row(
                "SELECT status, client_name, client_id, order_number, line_count,
                        web_mobile, phone_in_person, delivery_date
                 FROM crm_orders WHERE id = ?1",
                [receipt.remote_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                    ))
                },
            )
            .unwrap();
        assert_eq!(status, "N");
        assert_eq!(name, "Ana Pech");
        assert_eq!(client_id, 88);
        assert_eq!(order_number, "o1");
        assert_eq!(lines, 2);
        assert!(!web);
        assert!(phone);
        assert_eq!(delivery, "2026-03-05 14:30:00");
    }

    #[test]
    fn test_missing_user_falls_back_to_generic_name() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 999)
        };
        let receipt = sync_order_by_id(&stores, order_id, "admin").unwrap();
        let remote = stores.remote.conn.lock().unwrap();
        let (name, client_id): (String, i64) = remote
            .query_row(
                "SELECT client_name, client_id FROM crm_orders WHERE id = ?1",
                [receipt.remote_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "Client");
        assert_eq!(client_id, 0);
    }

    #[test]
    fn test_sales_counters_count_lines_not_units() {
        let stores = Stores::open_in_memory().unwrap();
        let (o1, o2) = {
            let conn = stores.local.conn.lock().unwrap();
            (seed_order(&conn, "o1", 1, 1), seed_order(&conn, "o2", 1, 1))
        };
        sync_order_by_id(&stores, o1, "admin").unwrap();
        sync_order_by_id(&stores, o2, "admin").unwrap();

        let remote = stores.remote.conn.lock().unwrap();
        let day_count: i64 = remote
            .query_row(
                "SELECT count FROM sales_by_product_day WHERE branch_id = 1 AND product_id = 501",
                [],
                |r| r.get(0),
            )
            .unwrap();
        // Two orders with one line each for product 501, quantity 2 per line.
        assert_eq!(day_count, 2);
        let month: String = remote
            .query_row(
                "SELECT month FROM sales_by_product_month WHERE product_id = 502",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(month.ends_with("-01"));
    }

    #[test]
    fn test_missing_order_is_not_found_and_nothing_allocated() {
        let stores = Stores::open_in_memory().unwrap();
        let err = sync_order_by_id(&stores, 404, "admin").unwrap_err();
        assert!(matches!(err, SyncError::OrderNotFound(404)));
        assert_eq!(remote_count(&stores, "crm_indices"), 0);
    }

    #[test]
    fn test_failed_detail_insert_rolls_back_both_stores() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 1)
        };
        {
            let remote = stores.remote.conn.lock().unwrap();
            remote.execute_batch("DROP TABLE crm_order_items").unwrap();
        }

        let err = sync_order_by_id(&stores, order_id, "admin").unwrap_err();
        assert!(matches!(err, SyncError::RemoteInsert(_) | SyncError::DetailInsert { .. }));
        assert_eq!(remote_count(&stores, "crm_orders"), 0);
        assert_eq!(remote_count(&stores, "crm_indices"), 0);

        let local = stores.local.conn.lock().unwrap();
        assert!(!ledger::is_synced(&local, order_id).unwrap());
        let claimed: Option<String> = local
            .query_row("SELECT sync_claimed_at FROM orders WHERE id = ?1", [order_id], |r| r.get(0))
            .unwrap();
        assert!(claimed.is_none(), "claim rolls back with the transaction");
    }

    #[test]
    fn test_request_branch_mismatch_is_rejected() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 1)
        };
        let mut req = SyncRequest::new(order_id, "admin");
        req.branch_id = Some(2);
        assert!(matches!(sync_order(&stores, &req), Err(SyncError::Validation(_))));

        req.branch_id = Some(1);
        req.client_key = Some("o1".into());
        assert!(sync_order(&stores, &req).is_ok());
    }

    #[test]
    fn test_unit_pricing_zero_quantity() {
        let unit = UnitPricing::from_line(12.0, 0.0, 5.0, 1.0);
        assert_eq!(unit.tax_general, 0.0);
        assert_eq!(unit.tax_special, 0.0);
        assert_eq!(unit.with_tax(), 12.0);
    }

    #[test]
    fn test_unit_pricing_reconstructs_price() {
        for (net, qty, tg, ts) in [(10.0, 3.0, 4.8, 0.0), (7.33, 7.0, 8.2096, 1.1), (0.01, 1.0, 0.0016, 0.0)] {
            let unit = UnitPricing::from_line(net, qty, tg, ts);
            let expected = net + tg / qty + ts / qty;
            assert!((unit.with_tax() - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_channel_flags() {
        assert_eq!(channel_flags("web"), (true, false));
        assert_eq!(channel_flags("Mobile"), (true, false));
        assert_eq!(channel_flags("phone"), (false, true));
        assert_eq!(channel_flags("in-person"), (false, true));
        assert_eq!(channel_flags("kiosk"), (false, false));
    }

    #[test]
    fn test_delivery_date_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        assert_eq!(parse_delivery_date("2026-03-05T14:30:00Z"), Some(expected));
        assert_eq!(parse_delivery_date("2026-03-05T14:30:00"), Some(expected));
        assert_eq!(parse_delivery_date("2026-03-05 14:30:00"), Some(expected));
        assert_eq!(parse_delivery_date("05/03/2026"), None);
    }

    #[test]
    fn test_missing_delivery_date_defaults_to_lead_days() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(resolve_delivery_date(None, now, 2), "2026-03-03 08:00:00");
        assert_eq!(resolve_delivery_date(Some(""), now, 2), "2026-03-03 08:00:00");
        assert_eq!(resolve_delivery_date(Some("garbage"), now, 1), "2026-03-02 08:00:00");
        assert_eq!(
            resolve_delivery_date(Some("2026-04-01T10:00:00"), now, 2),
            "2026-04-01 10:00:00"
        );
    }

    #[test]
    fn test_keys_are_md5_hex() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let a = order_key(1, "abc", now);
        let b = client_key_hash(1, "abc", now);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, b, "same inputs hash the same way");
        assert_ne!(a, order_key(2, "abc", now));
    }

    #[test]
    fn test_update_delivery_date_propagates_when_synced() {
        let stores = Stores::open_in_memory().unwrap();
        let (synced, unsynced) = {
            let conn = stores.local.conn.lock().unwrap();
            (seed_order(&conn, "o1", 1, 1), seed_order(&conn, "o2", 1, 1))
        };
        let receipt = sync_order_by_id(&stores, synced, "admin").unwrap();

        let update = update_delivery_date(&stores, synced, "2026-05-10T09:00:00Z").unwrap();
        assert!(update.synced);
        assert!(update.remote_updated);
        assert_eq!(update.delivery_date, "2026-05-10 09:00:00");
        {
            let remote = stores.remote.conn.lock().unwrap();
            let date: String = remote
                .query_row("SELECT delivery_date FROM crm_orders WHERE id = ?1", [receipt.remote_id], |r| r.get(0))
                .unwrap();
            assert_eq!(date, "2026-05-10 09:00:00");
        }

        let local_only = update_delivery_date(&stores, unsynced, "2026-05-11 09:00:00").unwrap();
        assert!(!local_only.synced);
        assert!(!local_only.remote_updated);

        assert!(matches!(
            update_delivery_date(&stores, 404, "2026-05-11 09:00:00"),
            Err(SyncError::OrderNotFound(404))
        ));
        assert!(matches!(
            update_delivery_date(&stores, synced, "tomorrow"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_remote_patch_failure_does_not_fail_update() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 1)
        };
        sync_order_by_id(&stores, order_id, "admin").unwrap();
        {
            let remote = stores.remote.conn.lock().unwrap();
            remote.execute_batch("DROP TABLE crm_orders").unwrap();
        }
        let update = update_delivery_date(&stores, order_id, "2026-05-10 09:00:00").unwrap();
        assert!(update.synced);
        assert!(!update.remote_updated);

        let local = stores.local.conn.lock().unwrap();
        let stored: String = local
            .query_row("SELECT delivery_date FROM orders WHERE id = ?1", [order_id], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "2026-05-10 09:00:00");
    }

    fn lose_local_commit(stores: &Stores, order_id: i64) {
        let conn = stores.local.conn.lock().unwrap();
        conn.execute(
            "UPDATE orders SET synced = 0, principal_id = NULL, remote_id = NULL, synced_at = NULL
             WHERE id = ?1",
            [order_id],
        )
        .unwrap();
    }

    #[test]
    fn test_retry_after_lost_local_commit_reuses_remote_order() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 1)
        };
        let first = sync_order_by_id(&stores, order_id, "admin").unwrap();
        lose_local_commit(&stores, order_id);

        let retry = sync_order_by_id(&stores, order_id, "admin").unwrap();
        assert!(retry.reconciled);
        assert_eq!(retry.principal_id, first.principal_id);
        assert_eq!(retry.remote_id, first.remote_id);
        assert_eq!(remote_count(&stores, "crm_orders"), 1);
        assert_eq!(remote_count(&stores, "crm_order_items"), 2);

        let conn = stores.local.conn.lock().unwrap();
        assert!(ledger::is_synced(&conn, order_id).unwrap());
    }

    #[test]
    fn test_retry_without_reconcile_inserts_again() {
        let stores = Stores::open_in_memory().unwrap();
        let order_id = {
            let conn = stores.local.conn.lock().unwrap();
            seed_order(&conn, "o1", 1, 1)
        };
        sync_order_by_id(&stores, order_id, "admin").unwrap();
        lose_local_commit(&stores, order_id);

        let req = SyncRequest::new(order_id, "admin").with_reconcile(false);
        let retry = sync_order(&stores, &req).unwrap();
        assert!(!retry.reconciled);
        assert_eq!(retry.principal_id, 2);
        assert_eq!(remote_count(&stores, "crm_orders"), 2);
    }

    #[test]
    fn test_concurrent_sync_from_two_connections_inserts_once() {
        use crate::config::Config;
        use std::sync::Barrier;

        let dir = std::env::temp_dir().join(format!("storefront_race_{}", uuid::Uuid::new_v4()));
        let config = Config {
            local_db_path: dir.join("local.db"),
            remote_db_path: dir.join("remote.db"),
            ..Config::default()
        };
        let facade = Stores::open(&config).unwrap();
        let sweeper = Stores::open(&config).unwrap();
        let order_id = {
            let conn = facade.local.conn.lock().unwrap();
            seed_order(&conn, "race", 1, 1)
        };

        let barrier = Barrier::new(2);
        let results: Vec<Result<SyncReceipt, SyncError>> = std::thread::scope(|s| {
            let handles: Vec<_> = [&facade, &sweeper]
                .into_iter()
                .map(|stores| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        sync_order_by_id(stores, order_id, "race")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(SyncError::AlreadySynchronized(id)) if *id == order_id))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(rejected, 1);
        assert_eq!(remote_count(&facade, "crm_orders"), 1);
        {
            let remote = sweeper.remote.conn.lock().unwrap();
            assert_eq!(sequence::current_order_principal(&remote, 1).unwrap(), 1);
        }

        drop(facade);
        drop(sweeper);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
