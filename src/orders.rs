//! Local order creation.
//!
//! Inserts an order and its lines with `synced` unset so the background loop
//! picks it up. When the caller does not name a branch, the resolver assigns
//! one from the delivery point (or the store's location).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::branches;
use crate::error::{DbContext, SyncError};
use crate::geo::GeoPoint;
use crate::ledger::format_timestamp;
use crate::sync::{parse_delivery_date, resolve_delivery_date};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderLine {
    pub product_id: i64,
    #[serde(default)]
    pub product_code: String,
    pub description: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub quantity: f64,
    /// Net unit price before taxes.
    pub unit_price: f64,
    #[serde(default)]
    pub discount_pct: f64,
    /// Fraction, e.g. `0.16`.
    #[serde(default)]
    pub tax_general_rate: f64,
    #[serde(default)]
    pub tax_special_rate: f64,
}

fn default_unit() -> String {
    "PZA".to_string()
}

fn default_origin() -> String {
    "web".to_string()
}

fn default_one() -> i64 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub client_key: Option<String>,
    pub user_id: i64,
    pub store_id: i64,
    pub branch_id: Option<i64>,
    pub delivery_date: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryAddress,
    #[serde(default = "default_one")]
    pub payment_method_id: i64,
    pub payment_reference: Option<String>,
    pub comments: Option<String>,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_one")]
    pub price_list_id: i64,
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: i64,
    pub client_key: String,
    pub branch_id: i64,
    pub delivery_date: String,
    pub subtotal: f64,
    pub tax_general: f64,
    pub tax_special: f64,
    pub total: f64,
}

/// Computed money columns of one line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineAmounts {
    pub discount_amount: f64,
    pub subtotal: f64,
    pub tax_general: f64,
    pub tax_special: f64,
    pub total: f64,
}

impl LineAmounts {
    pub fn compute(line: &NewOrderLine) -> Self {
        let gross = line.quantity * line.unit_price;
        let discount_amount = gross * line.discount_pct / 100.0;
        let subtotal = gross - discount_amount;
        let tax_general = subtotal * line.tax_general_rate;
        let tax_special = subtotal * line.tax_special_rate;
        Self {
            discount_amount,
            subtotal,
            tax_general,
            tax_special,
            total: subtotal + tax_general + tax_special,
        }
    }
}

fn validate(order: &NewOrder) -> Result<(), SyncError> {
    if order.lines.is_empty() {
        return Err(SyncError::Validation("order has no lines".into()));
    }
    for (idx, line) in order.lines.iter().enumerate() {
        if !(line.quantity > 0.0) {
            return Err(SyncError::Validation(format!(
                "line {} has non-positive quantity",
                idx + 1
            )));
        }
        if !(line.unit_price >= 0.0) || !(0.0..=100.0).contains(&line.discount_pct) {
            return Err(SyncError::Validation(format!(
                "line {} has an invalid price or discount",
                idx + 1
            )));
        }
    }
    if let Some(raw) = order.delivery_date.as_deref() {
        if parse_delivery_date(raw).is_none() {
            return Err(SyncError::Validation(format!(
                "unrecognized delivery date {raw:?}"
            )));
        }
    }
    Ok(())
}

/// Store owner, company and location.
fn load_store(conn: &Connection, store_id: i64) -> Result<(i64, i64, Option<GeoPoint>), SyncError> {
    let row: Option<(i64, i64, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT user_id, company_id, latitude, longitude FROM stores WHERE id = ?1",
            params![store_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .db_context("load store")?;
    let (user_id, company_id, lat, lng) = row.ok_or(SyncError::NotFound {
        entity: "store",
        id: store_id,
    })?;
    Ok((user_id, company_id, lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng))))
}

/// Insert a new unsynced order. `lead_days` sets the delivery date when
/// the order does not carry one.
pub fn create_order(
    conn: &mut Connection,
    order: &NewOrder,
    lead_days: i64,
) -> Result<CreatedOrder, SyncError> {
    validate(order)?;

    let (owner_id, company_id, store_point) = load_store(conn, order.store_id)?;
    if owner_id != order.user_id {
        return Err(SyncError::Validation(format!(
            "store {} does not belong to user {}",
            order.store_id, order.user_id
        )));
    }

    let branch_id = match order.branch_id {
        Some(id) => id,
        None => {
            let point = order
                .delivery
                .latitude
                .zip(order.delivery.longitude)
                .map(|(lat, lng)| GeoPoint::new(lat, lng))
                .or(store_point)
                .ok_or_else(|| {
                    SyncError::Validation("no branch given and no delivery coordinates".into())
                })?;
            branches::resolve_branch(conn, company_id, point)?.branch_id
        }
    };

    let now = Utc::now();
    let created_at = format_timestamp(now);
    let delivery_date = resolve_delivery_date(order.delivery_date.as_deref(), now, lead_days);
    let client_key = order
        .client_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let amounts: Vec<LineAmounts> = order.lines.iter().map(LineAmounts::compute).collect();
    let subtotal: f64 = amounts.iter().map(|a| a.subtotal).sum();
    let discount: f64 = amounts.iter().map(|a| a.discount_amount).sum();
    let tax_general: f64 = amounts.iter().map(|a| a.tax_general).sum();
    let tax_special: f64 = amounts.iter().map(|a| a.tax_special).sum();
    let total: f64 = amounts.iter().map(|a| a.total).sum();

    let tx = conn.transaction().db_context("begin order insert")?;
    tx.execute(
        "INSERT INTO orders (
            client_key, user_id, store_id, branch_id, created_at, delivery_date,
            subtotal, discount, tax_general, tax_special, total,
            payment_method_id, payment_reference,
            delivery_address, delivery_district, delivery_postal_code, delivery_city, delivery_state,
            delivery_latitude, delivery_longitude, status, comments, origin, price_list_id, synced
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                  ?19, ?20, 'pending', ?21, ?22, ?23, NULL)",
        params![
            client_key,
            order.user_id,
            order.store_id,
            branch_id,
            created_at,
            delivery_date,
            subtotal,
            discount,
            tax_general,
            tax_special,
            total,
            order.payment_method_id,
            order.payment_reference,
            order.delivery.address,
            order.delivery.district,
            order.delivery.postal_code,
            order.delivery.city,
            order.delivery.state,
            order.delivery.latitude,
            order.delivery.longitude,
            order.comments,
            order.origin,
            order.price_list_id,
        ],
    )
    .db_context("insert order")?;
    let order_id = tx.last_insert_rowid();

    {
        let mut insert_line = tx
            .prepare(
                "INSERT INTO order_items (
                    order_id, product_id, product_code, description, unit, quantity, unit_price,
                    discount_pct, discount_amount, subtotal, tax_general, tax_special, total
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .db_context("prepare order item")?;
        for (line, a) in order.lines.iter().zip(&amounts) {
            insert_line
                .execute(params![
                    order_id,
                    line.product_id,
                    line.product_code,
                    line.description,
                    line.unit,
                    line.quantity,
                    line.unit_price,
                    line.discount_pct,
                    a.discount_amount,
                    a.subtotal,
                    a.tax_general,
                    a.tax_special,
                    a.total,
                ])
                .db_context("insert order item")?;
        }
    }
    tx.commit().db_context("commit order")?;

    info!(order_id, branch_id, client_key = %client_key, total, "Order created");

    Ok(CreatedOrder {
        order_id,
        client_key,
        branch_id,
        delivery_date,
        subtotal,
        tax_general,
        tax_special,
        total,
    })
}
