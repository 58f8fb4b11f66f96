//! Request façade used by the HTTP layer.
//!
//! Each command takes an optional JSON payload (object, or a bare id for
//! single-id commands), calls into the core and returns JSON. Errors carry
//! an HTTP-equivalent status.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::background::SyncState;
use crate::config::Config;
use crate::db::Stores;
use crate::error::SyncError;

pub mod branches;
pub mod diagnostics;
pub mod orders;
pub mod sync;

/// Everything a command needs. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub stores: Arc<Stores>,
    pub sync_state: Arc<SyncState>,
    pub config: Config,
}

impl AppContext {
    pub fn new(stores: Arc<Stores>, sync_state: Arc<SyncState>, config: Config) -> Self {
        Self {
            stores,
            sync_state,
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: 409,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self {
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}

fn id_object(id_key: &str, id: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(id_key.to_string(), id);
    Value::Object(obj)
}

/// Normalize `arg0` into an object. A bare number or numeric string becomes
/// `{ id_key: n }`.
fn payload_object(arg0: Option<Value>, id_key: &str) -> Value {
    match arg0 {
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(Value::Number(n)) => id_object(id_key, Value::Number(n)),
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(n) => id_object(id_key, Value::from(n)),
            Err(_) => Value::String(s),
        },
        Some(v) => v,
        None => serde_json::json!({}),
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(
    arg0: Option<Value>,
    id_key: &str,
    what: &str,
) -> Result<T, ApiError> {
    serde_json::from_value(payload_object(arg0, id_key))
        .map_err(|e| ApiError::bad_request(format!("Invalid {what} payload: {e}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError {
        status: 500,
        message: format!("serialize response: {e}"),
    })
}
