use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json, ApiError, AppContext};
use crate::background::{self, SweepOptions};
use crate::error::SyncError;
use crate::ledger::{self, RemoteRef};
use crate::sync::{self as core_sync, SyncRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncOrderPayload {
    #[serde(alias = "order_id", alias = "id")]
    order_id: i64,
    #[serde(default, alias = "branch_id")]
    branch_id: Option<i64>,
    #[serde(default, alias = "client_key")]
    client_key: Option<String>,
    #[serde(default, alias = "user")]
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderIdPayload {
    #[serde(alias = "order_id", alias = "id")]
    order_id: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FindByRemotePayload {
    #[serde(default, alias = "remote_id")]
    remote_id: Option<i64>,
    #[serde(default, alias = "principal_id")]
    principal_id: Option<i64>,
    #[serde(default, alias = "branch_id")]
    branch_id: Option<i64>,
}

const DEFAULT_MANUAL_ACTOR: &str = "admin";

/// Manual "sync now". Every failure is reported as a conflict.
pub fn sync_order_now(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: SyncOrderPayload = parse_payload(arg0, "orderId", "sync order")?;
    let actor = payload
        .actor
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| DEFAULT_MANUAL_ACTOR.to_string());

    let req = SyncRequest {
        order_id: payload.order_id,
        branch_id: payload.branch_id,
        client_key: payload.client_key,
        actor,
        delivery_lead_days: ctx.config.delivery_lead_days,
        reconcile_orphans: ctx.config.reconcile_orphans,
    };

    let receipt = core_sync::sync_order(&ctx.stores, &req).map_err(|e| ApiError::conflict(e.to_string()))?;
    let message = if receipt.reconciled {
        "Order reconciled with existing remote order"
    } else {
        "Order synchronized"
    };
    Ok(json!({
        "success": true,
        "message": message,
        "reconciled": receipt.reconciled,
        "principalId": receipt.principal_id,
        "remoteId": receipt.remote_id,
    }))
}

pub fn verify_sync(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: OrderIdPayload = parse_payload(arg0, "orderId", "verify sync")?;
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let status = ledger::verify_sync(&conn, payload.order_id)?;
    to_json(&status)
}

pub fn list_pending_sync(ctx: &AppContext) -> Result<Value, ApiError> {
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let pending = ledger::list_pending(&conn)?;
    to_json(&pending)
}

pub fn sync_history(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: OrderIdPayload = parse_payload(arg0, "orderId", "sync history")?;
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let history = ledger::sync_history(&conn, payload.order_id)?;
    to_json(&history)
}

pub fn find_by_remote(ctx: &AppContext, arg0: Option<Value>) -> Result<Value, ApiError> {
    let payload: FindByRemotePayload = parse_payload(arg0, "remoteId", "find by remote")?;
    let remote = match (payload.remote_id, payload.principal_id) {
        (Some(remote_id), _) => RemoteRef::RemoteId(remote_id),
        (None, Some(principal_id)) => RemoteRef::Principal {
            principal_id,
            branch_id: payload.branch_id,
        },
        (None, None) => return Err(ApiError::bad_request("remoteId or principalId is required")),
    };
    let conn = ctx.stores.local.conn.lock().map_err(SyncError::from)?;
    let summary = ledger::find_by_remote(&conn, remote)?;
    to_json(&summary)
}

/// Run one sweep immediately.
pub async fn force_sweep(ctx: &AppContext) -> Result<Value, ApiError> {
    let report = background::force_sweep(
        ctx.stores.clone(),
        &ctx.sync_state,
        SweepOptions::from_config(&ctx.config),
    )
    .await?;
    to_json(&report)
}
