//! SQLite store layer for the storefront backend.
//!
//! Two independent databases are opened through rusqlite with WAL mode:
//! the local operational store (orders, users, branches) and the remote
//! system-of-record store (`crm_*` tables). Each has its own versioned
//! migrations. There is no shared transaction manager between them.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{DbContext, SyncError};

/// Which side of the synchronization a database plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Local,
    Remote,
}

impl StoreRole {
    fn label(self) -> &'static str {
        match self {
            StoreRole::Local => "local",
            StoreRole::Remote => "remote",
        }
    }

    fn current_version(self) -> i32 {
        match self {
            StoreRole::Local => LOCAL_SCHEMA_VERSION,
            StoreRole::Remote => REMOTE_SCHEMA_VERSION,
        }
    }
}

/// One database connection plus where it lives.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
    pub role: StoreRole,
}

/// The local/remote pair every core operation works against.
///
/// Locks are always taken local first, then remote.
pub struct Stores {
    pub local: DbState,
    pub remote: DbState,
}

type MigrationStep = fn(&Connection) -> Result<(), rusqlite::Error>;

const LOCAL_MIGRATIONS: &[MigrationStep] = &[migrate_local_v1, migrate_local_v2];
const REMOTE_MIGRATIONS: &[MigrationStep] = &[migrate_remote_v1, migrate_remote_v2];

const LOCAL_SCHEMA_VERSION: i32 = LOCAL_MIGRATIONS.len() as i32;
const REMOTE_SCHEMA_VERSION: i32 = REMOTE_MIGRATIONS.len() as i32;

impl Stores {
    /// Open both stores from configuration, running pending migrations.
    pub fn open(config: &Config) -> Result<Self, SyncError> {
        Ok(Self {
            local: init(&config.local_db_path, StoreRole::Local)?,
            remote: init(&config.remote_db_path, StoreRole::Remote)?,
        })
    }

    /// Fresh migrated in-memory pair, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        Ok(Self {
            local: init_in_memory(StoreRole::Local)?,
            remote: init_in_memory(StoreRole::Remote)?,
        })
    }

    /// Ping both stores.
    pub fn check_connections(&self) -> Result<(), SyncError> {
        for state in [&self.local, &self.remote] {
            let conn = state.conn.lock()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .db_context("connection check")?;
        }
        Ok(())
    }
}

/// Open (creating if needed) the database at `path` and migrate it.
pub fn init(path: &Path, role: StoreRole) -> Result<DbState, SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SyncError::Io {
            context: "create data dir",
            source,
        })?;
    }

    info!("Opening {} store at {}", role.label(), path.display());
    let conn = open_and_configure(path)?;
    run_migrations(&conn, role)?;

    info!(
        "{} store initialized (schema v{})",
        role.label(),
        role.current_version()
    );

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: path.to_path_buf(),
        role,
    })
}

fn init_in_memory(role: StoreRole) -> Result<DbState, SyncError> {
    let conn = Connection::open_in_memory().db_context("sqlite open")?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .db_context("pragma setup")?;
    run_migrations(&conn, role)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
        role,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path).db_context("sqlite open")?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .db_context("pragma setup")?;

    Ok(conn)
}

/// Run all pending migrations for `role` up to its current version.
fn run_migrations(conn: &Connection, role: StoreRole) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .db_context("create schema_version")?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .db_context("read schema_version")?;

    let target = role.current_version();
    if current >= target {
        info!("{} schema up to date (v{current})", role.label());
        return Ok(());
    }

    info!("Migrating {} store from v{current} to v{target}", role.label());

    let steps = match role {
        StoreRole::Local => LOCAL_MIGRATIONS,
        StoreRole::Remote => REMOTE_MIGRATIONS,
    };

    for (idx, step) in steps.iter().enumerate() {
        let version = idx as i32 + 1;
        if current >= version {
            continue;
        }
        step(conn).map_err(|source| {
            error!("{} migration v{version} failed: {source}", role.label());
            SyncError::Database {
                context: "migration",
                source,
            }
        })?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![version],
        )
        .db_context("record migration")?;
        info!("Applied {} migration v{version}", role.label());
    }

    Ok(())
}

/// Local v1: companies, branches with geofences, users, stores, orders.
fn migrate_local_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS companies (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            id INTEGER PRIMARY KEY,
            company_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'S' CHECK (status IN ('S', 'N')),
            fence_type TEXT NOT NULL DEFAULT 'N',
            radius_km REAL NOT NULL DEFAULT 0,
            price_list_id INTEGER NOT NULL DEFAULT 1
        );

        -- ordered geofence vertices; the first row is a circle's center
        CREATE TABLE IF NOT EXISTS branch_fence_points (
            branch_id INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            PRIMARY KEY (branch_id, ordinal),
            FOREIGN KEY(branch_id) REFERENCES branches(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            company_id INTEGER NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT,
            remote_client_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS stores (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            company_id INTEGER NOT NULL,
            branch_id INTEGER,
            branch_name TEXT,
            name TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_key TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            store_id INTEGER NOT NULL,
            branch_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            delivery_date TEXT,
            subtotal REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            tax_general REAL NOT NULL DEFAULT 0,
            tax_special REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            payment_method_id INTEGER NOT NULL DEFAULT 1,
            payment_reference TEXT,
            delivery_address TEXT NOT NULL DEFAULT '',
            delivery_district TEXT NOT NULL DEFAULT '',
            delivery_postal_code TEXT NOT NULL DEFAULT '',
            delivery_city TEXT NOT NULL DEFAULT '',
            delivery_state TEXT NOT NULL DEFAULT '',
            delivery_latitude REAL,
            delivery_longitude REAL,
            status TEXT NOT NULL DEFAULT 'pending',
            comments TEXT,
            origin TEXT NOT NULL DEFAULT 'web',
            price_list_id INTEGER NOT NULL DEFAULT 1,
            synced INTEGER,
            principal_id INTEGER,
            remote_id INTEGER,
            synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            product_code TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL,
            unit TEXT NOT NULL DEFAULT 'PZA',
            quantity REAL NOT NULL,
            unit_price REAL NOT NULL,
            discount_pct REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            subtotal REAL NOT NULL,
            tax_general REAL NOT NULL DEFAULT 0,
            tax_special REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL,
            FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_branches_company ON branches(company_id, status);
        CREATE INDEX IF NOT EXISTS idx_orders_synced ON orders(synced);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        ",
    )
}

/// Local v2: sync claim column and the append-only sync audit log.
fn migrate_local_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        ALTER TABLE orders ADD COLUMN sync_claimed_at TEXT;

        CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            attempt_id TEXT NOT NULL,
            order_id INTEGER NOT NULL,
            principal_id INTEGER,
            remote_id INTEGER,
            logged_at TEXT NOT NULL,
            actor TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('OK', 'FAILED', 'RECONCILED')),
            detail TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_orders_remote_id ON orders(remote_id);
        CREATE INDEX IF NOT EXISTS idx_orders_principal_id ON orders(principal_id);
        CREATE INDEX IF NOT EXISTS idx_sync_log_order ON sync_log(order_id);
        ",
    )
}

/// Remote v1: sequence counters, orders and their lines, clients.
fn migrate_remote_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS crm_indices (
            branch_id INTEGER PRIMARY KEY,
            last_order_id INTEGER NOT NULL DEFAULT 0,
            last_client_id INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS crm_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            principal_id INTEGER NOT NULL,
            order_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'N',
            delivery_date TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            delivered_at TEXT NOT NULL,
            comments TEXT,
            client_key TEXT NOT NULL,
            client_name TEXT NOT NULL,
            contact TEXT NOT NULL,
            amount REAL NOT NULL,
            tax_general REAL NOT NULL,
            tax_special REAL NOT NULL,
            discount REAL NOT NULL,
            invoice TEXT NOT NULL DEFAULT 'N',
            price_list_id INTEGER NOT NULL,
            payment_method_id INTEGER NOT NULL,
            order_number TEXT NOT NULL,
            line_count INTEGER NOT NULL,
            web_mobile INTEGER NOT NULL DEFAULT 0,
            phone_in_person INTEGER NOT NULL DEFAULT 0,
            branch_id INTEGER NOT NULL,
            client_id INTEGER NOT NULL DEFAULT 0,
            UNIQUE(branch_id, principal_id)
        );

        CREATE TABLE IF NOT EXISTS crm_order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            description TEXT NOT NULL,
            price REAL NOT NULL,
            quantity REAL NOT NULL,
            net_price REAL NOT NULL,
            tax_general REAL NOT NULL,
            tax_special REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS crm_clients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            branch_id INTEGER NOT NULL,
            client_number INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'S',
            mobile_key TEXT NOT NULL,
            trade_name TEXT NOT NULL,
            legal_name TEXT,
            tax_code TEXT,
            price_list_id INTEGER NOT NULL DEFAULT 1,
            UNIQUE(branch_id, client_number)
        );

        CREATE INDEX IF NOT EXISTS idx_crm_orders_number ON crm_orders(branch_id, order_number);
        CREATE INDEX IF NOT EXISTS idx_crm_order_items_order ON crm_order_items(order_id);
        ",
    )
}

/// Remote v2: per-branch, per-product sales occurrence aggregates.
fn migrate_remote_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sales_by_product_day (
            branch_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            day TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (branch_id, product_id, day)
        );

        CREATE TABLE IF NOT EXISTS sales_by_product_month (
            branch_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            month TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (branch_id, product_id, month)
        );
        ",
    )
}

/// Current migrated schema version of an open connection.
pub fn schema_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, Option<i32>>(0),
    )
    .optional()
    .db_context("read schema_version")
    .map(|v| v.flatten().unwrap_or(0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_local_migrations_create_tables() {
        let stores = Stores::open_in_memory().expect("open stores");
        let conn = stores.local.conn.lock().unwrap();
        let tables = table_names(&conn);
        for expected in [
            "branches",
            "branch_fence_points",
            "orders",
            "order_items",
            "sync_log",
            "users",
            "stores",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(schema_version(&conn).unwrap(), LOCAL_SCHEMA_VERSION);
    }

    #[test]
    fn test_remote_migrations_create_tables() {
        let stores = Stores::open_in_memory().expect("open stores");
        let conn = stores.remote.conn.lock().unwrap();
        let tables = table_names(&conn);
        for expected in [
            "crm_indices",
            "crm_orders",
            "crm_order_items",
            "crm_clients",
            "sales_by_product_day",
            "sales_by_product_month",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(schema_version(&conn).unwrap(), REMOTE_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let stores = Stores::open_in_memory().expect("open stores");
        let conn = stores.local.conn.lock().unwrap();
        run_migrations(&conn, StoreRole::Local).expect("second run should succeed");
        assert_eq!(schema_version(&conn).unwrap(), LOCAL_SCHEMA_VERSION);
    }

    #[test]
    fn test_sync_log_rejects_unknown_outcome() {
        let stores = Stores::open_in_memory().expect("open stores");
        let conn = stores.local.conn.lock().unwrap();
        let bad = conn.execute(
            "INSERT INTO sync_log (attempt_id, order_id, logged_at, actor, outcome)
             VALUES ('a', 1, datetime('now'), 'test', 'MAYBE')",
            [],
        );
        assert!(bad.is_err(), "invalid outcome should be rejected");
    }

    #[test]
    fn test_remote_order_branch_principal_unique() {
        let stores = Stores::open_in_memory().expect("open stores");
        let conn = stores.remote.conn.lock().unwrap();
        let insert = "INSERT INTO crm_orders (
                principal_id, order_key, delivery_date, created_at, updated_at, delivered_at,
                client_key, client_name, contact, amount, tax_general, tax_special, discount,
                price_list_id, payment_method_id, order_number, line_count, branch_id
            ) VALUES (1, 'k', 'd', 'c', 'u', 'm', 'ck', 'n', 'p', 1, 0, 0, 0, 1, 1, 'o', 1, 9)";
        conn.execute(insert, []).expect("first insert");
        assert!(
            conn.execute(insert, []).is_err(),
            "duplicate (branch_id, principal_id) should be rejected"
        );
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("storefront_wal_{}", uuid::Uuid::new_v4()));
        let db_path = dir.join("local.db");

        let state = init(&db_path, StoreRole::Local).expect("open temp db");
        {
            let conn = state.conn.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .expect("read journal_mode");
            assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
        }

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_check_connections() {
        let stores = Stores::open_in_memory().expect("open stores");
        stores.check_connections().expect("both stores answer");
    }
}
