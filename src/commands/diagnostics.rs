use serde_json::Value;

use super::{to_json, ApiError, AppContext};
use crate::diagnostics;

pub fn about() -> Value {
    diagnostics::get_about_info()
}

pub fn sync_health(ctx: &AppContext) -> Result<Value, ApiError> {
    let health = diagnostics::get_sync_health(&ctx.stores, &ctx.sync_state)?;
    to_json(&health)
}
