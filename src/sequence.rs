//! Per-branch counters in `crm_indices`.
//!
//! Each allocation is one upsert statement returning the new value, so two
//! writers can never observe the same number. Values allocated inside a
//! transaction that later rolls back leave a gap.

use rusqlite::{params, Connection};

use crate::error::{DbContext, SyncError};

/// Next order principal id for `branch_id`.
pub fn next_order_principal(conn: &Connection, branch_id: i64) -> Result<i64, SyncError> {
    conn.query_row(
        "INSERT INTO crm_indices (branch_id, last_order_id, last_client_id)
         VALUES (?1, 1, 0)
         ON CONFLICT(branch_id) DO UPDATE SET last_order_id = last_order_id + 1
         RETURNING last_order_id",
        params![branch_id],
        |row| row.get(0),
    )
    .db_context("allocate order principal")
}

/// Next client number for `branch_id`.
pub fn next_client_number(conn: &Connection, branch_id: i64) -> Result<i64, SyncError> {
    conn.query_row(
        "INSERT INTO crm_indices (branch_id, last_order_id, last_client_id)
         VALUES (?1, 0, 1)
         ON CONFLICT(branch_id) DO UPDATE SET last_client_id = last_client_id + 1
         RETURNING last_client_id",
        params![branch_id],
        |row| row.get(0),
    )
    .db_context("allocate client number")
}

/// Last issued principal id, 0 if the branch has none yet.
pub fn current_order_principal(conn: &Connection, branch_id: i64) -> Result<i64, SyncError> {
    conn.query_row(
        "SELECT COALESCE(MAX(last_order_id), 0) FROM crm_indices WHERE branch_id = ?1",
        params![branch_id],
        |row| row.get(0),
    )
    .db_context("read order principal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Stores;

    #[test]
    fn test_order_principal_starts_at_one_and_increments() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.remote.conn.lock().unwrap();
        assert_eq!(current_order_principal(&conn, 7).unwrap(), 0);
        assert_eq!(next_order_principal(&conn, 7).unwrap(), 1);
        assert_eq!(next_order_principal(&conn, 7).unwrap(), 2);
        assert_eq!(next_order_principal(&conn, 8).unwrap(), 1);
        assert_eq!(current_order_principal(&conn, 7).unwrap(), 2);
    }

    #[test]
    fn test_counters_are_independent() {
        let stores = Stores::open_in_memory().unwrap();
        let conn = stores.remote.conn.lock().unwrap();
        assert_eq!(next_client_number(&conn, 7).unwrap(), 1);
        assert_eq!(next_order_principal(&conn, 7).unwrap(), 1);
        assert_eq!(next_client_number(&conn, 7).unwrap(), 2);
        assert_eq!(current_order_principal(&conn, 7).unwrap(), 1);
    }

    #[test]
    fn test_rolled_back_allocation_is_not_kept() {
        let stores = Stores::open_in_memory().unwrap();
        let mut conn = stores.remote.conn.lock().unwrap();
        {
            let tx = conn.transaction().unwrap();
            assert_eq!(next_order_principal(&tx, 3).unwrap(), 1);
            // dropped without commit
        }
        assert_eq!(current_order_principal(&conn, 3).unwrap(), 0);
    }
}
