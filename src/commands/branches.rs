use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json, ApiError, AppContext};
use crate::branches;
use crate::error::SyncError;
use crate::geo::GeoPoint;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBranchPayload {
    #[serde(alias = "company_id", alias = "companyID")]
    company_id: i64,
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "lon", alias = "lng", alias = "longitude")]
    lng: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckAlertPayload {
    #[serde(alias = "branch_id", alias = "id")]
    branch_id: i64,
    /// `"E"` matches inside, anything else matches outside.
    #[serde(default = "default_aviso", alias = "alert", alias = "mode")]
    aviso: String,
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "lon", alias = "lng", alias = "longitude")]
    lng: f64,
}

fn default_aviso() -> String {
    "E".to_string()
}

pub fn resolve_branch(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: ResolveBranchPayload = parse_payload(arg0, "companyId", "resolve branch")?;
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let found = branches::resolve_branch(
        &conn,
        payload.company_id,
        GeoPoint::new(payload.lat, payload.lng),
    )?;
    to_json(&found)
}

pub fn check_alert(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: CheckAlertPayload = parse_payload(arg0, "branchId", "check alert")?;
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let check = branches::check_alert(
        &conn,
        payload.branch_id,
        &payload.aviso,
        GeoPoint::new(payload.lat, payload.lng),
    )?;
    Ok(json!({
        "branchId": payload.branch_id,
        "matched": check.matched,
        "distanceKm": check.distance_km,
    }))
}
