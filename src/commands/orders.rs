use serde::Deserialize;
use serde_json::Value;

use super::{parse_payload, to_json, ApiError, AppContext};
use crate::error::SyncError;
use crate::orders::{self, NewOrder};
use crate::registration::{self, NewStore};
use crate::sync as core_sync;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryDatePayload {
    #[serde(alias = "order_id", alias = "id")]
    order_id: i64,
    #[serde(alias = "delivery_date", alias = "date")]
    delivery_date: String,
}

pub fn create_order(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: NewOrder = parse_payload(arg0, "orderId", "create order")?;
    let mut conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let created = orders::create_order(&mut conn, &payload, ctx.config.delivery_lead_days)?;
    to_json(&created)
}

pub fn register_store(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: NewStore = parse_payload(arg0, "userId", "register store")?;
    let registered = registration::register_store(&ctx.stores, &payload)?;
    to_json(&registered)
}

pub fn update_delivery_date(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: DeliveryDatePayload = parse_payload(arg0, "orderId", "delivery date")?;
    if payload.delivery_date.trim().is_empty() {
        return Err(ApiError::bad_request("deliveryDate is required"));
    }
    let updated = core_sync::update_delivery_date(&ctx.stores, payload.order_id, &payload.delivery_date)?;
    to_json(&updated)
}
