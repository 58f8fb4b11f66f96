//! Error taxonomy for the synchronization core.
//!
//! Every fallible operation in the crate returns [`SyncError`]. Callers that
//! render results for HTTP use [`SyncError::status_code`]; the background
//! loop only logs them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("order {0} is already synchronized")]
    AlreadySynchronized(i64),

    #[error("remote insert failed: {0}")]
    RemoteInsert(#[source] rusqlite::Error),

    #[error("detail insert failed for line {ordinal}: {source}")]
    DetailInsert {
        ordinal: usize,
        source: rusqlite::Error,
    },

    #[error("remote commit failed: {0}")]
    RemoteCommit(#[source] rusqlite::Error),

    #[error(
        "local commit failed after remote commit \
         (order {order_id}, principal_id {principal_id}, remote_id {remote_id}): {source}"
    )]
    LocalCommit {
        order_id: i64,
        principal_id: i64,
        remote_id: i64,
        source: rusqlite::Error,
    },

    #[error("invalid geofence for branch {branch_id}: {reason}")]
    InvalidGeofence { branch_id: i64, reason: String },

    #[error("no valid branches for company {0}")]
    NoValidBranch(i64),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: std::io::Error,
    },

    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Coarse classification used for status codes and log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Infrastructure,
    PartialCommit,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::OrderNotFound(_) | SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::AlreadySynchronized(_) => ErrorKind::Conflict,
            SyncError::InvalidGeofence { .. }
            | SyncError::NoValidBranch(_)
            | SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::LocalCommit { .. } => ErrorKind::PartialCommit,
            SyncError::RemoteInsert(_)
            | SyncError::DetailInsert { .. }
            | SyncError::RemoteCommit(_)
            | SyncError::Database { .. }
            | SyncError::Io { .. }
            | SyncError::LockPoisoned(_)
            | SyncError::Task(_) => ErrorKind::Infrastructure,
        }
    }

    /// HTTP-equivalent status for the request façade.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Infrastructure | ErrorKind::PartialCommit => 500,
        }
    }

    /// Short machine-readable tag, recorded in the sync audit log.
    pub fn tag(&self) -> &'static str {
        match self {
            SyncError::OrderNotFound(_) => "order_not_found",
            SyncError::NotFound { .. } => "not_found",
            SyncError::AlreadySynchronized(_) => "already_synchronized",
            SyncError::RemoteInsert(_) => "remote_insert_failed",
            SyncError::DetailInsert { .. } => "detail_insert_failed",
            SyncError::RemoteCommit(_) => "remote_commit_failed",
            SyncError::LocalCommit { .. } => "local_commit_failed",
            SyncError::InvalidGeofence { .. } => "invalid_geofence",
            SyncError::NoValidBranch(_) => "no_valid_branch",
            SyncError::Validation(_) => "validation",
            SyncError::Database { .. } => "database",
            SyncError::Io { .. } => "io",
            SyncError::LockPoisoned(_) => "lock_poisoned",
            SyncError::Task(_) => "task_failed",
        }
    }
}

/// Attach a static context string to a raw rusqlite error.
pub(crate) trait DbContext<T> {
    fn db_context(self, context: &'static str) -> Result<T, SyncError>;
}

impl<T> DbContext<T> for Result<T, rusqlite::Error> {
    fn db_context(self, context: &'static str) -> Result<T, SyncError> {
        self.map_err(|source| SyncError::Database { context, source })
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned(e.to_string())
    }
}
