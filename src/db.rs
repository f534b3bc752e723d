//! Local SQLite database layer for The Small PMS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! connection state every workflow function takes explicitly — there is no
//! ambient/global database handle in this crate.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
///
/// Workflow functions receive `&DbState` so tests can substitute an
/// in-memory database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/pms.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("pms.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: property registry, tenancies, and payments.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- properties
        CREATE TABLE IF NOT EXISTS properties (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address_line1 TEXT NOT NULL,
            address_line2 TEXT,
            city TEXT NOT NULL,
            postcode TEXT NOT NULL,
            capacity INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'active',
            landlord_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- rooms (cascade with their property)
        CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            room_number TEXT NOT NULL,
            room_status TEXT NOT NULL DEFAULT 'available',
            monthly_rent REAL NOT NULL DEFAULT 0,
            deposit_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(property_id, room_number)
        );

        -- tenancies (rent/deposit copied from the room at assignment time)
        CREATE TABLE IF NOT EXISTS tenancies (
            id TEXT PRIMARY KEY,
            lodger_id TEXT NOT NULL,
            property_id TEXT NOT NULL REFERENCES properties(id),
            room_id TEXT NOT NULL REFERENCES rooms(id),
            start_date TEXT NOT NULL,
            end_date TEXT,
            tenancy_status TEXT NOT NULL DEFAULT 'pending',
            deposit_status TEXT NOT NULL DEFAULT 'unpaid',
            monthly_rent REAL NOT NULL DEFAULT 0,
            deposit_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- payments
        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            tenancy_id TEXT NOT NULL REFERENCES tenancies(id) ON DELETE CASCADE,
            payment_type TEXT NOT NULL,
            amount REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'pending',
            reference TEXT NOT NULL,
            due_date TEXT,
            paid_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_rooms_property ON rooms(property_id);
        CREATE INDEX IF NOT EXISTS idx_tenancies_room ON tenancies(room_id);
        CREATE INDEX IF NOT EXISTS idx_payments_tenancy ON payments(tenancy_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (registry, tenancies, payments)");
    Ok(())
}

/// Migration v2: deposit ledger (extra_charges) and in-app notifications.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- extra_charges: generic ledger; deposit deductions use
        -- charge_type = 'deposit_deduction'
        CREATE TABLE IF NOT EXISTS extra_charges (
            id TEXT PRIMARY KEY,
            tenancy_id TEXT NOT NULL REFERENCES tenancies(id) ON DELETE CASCADE,
            charge_type TEXT NOT NULL,
            amount REAL NOT NULL DEFAULT 0,
            reason TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- notifications: fire-and-forget rows for the dashboard to display
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            notification_type TEXT NOT NULL DEFAULT 'general',
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_extra_charges_tenancy
            ON extra_charges(tenancy_id, charge_type);
        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (extra_charges, notifications)");
    Ok(())
}

/// Migration v3: uniqueness backstop for payment references.
///
/// References are generated inside the assignment write transaction, so
/// duplicates should never reach this index; it exists so a duplicate
/// insert fails loudly instead of silently corrupting the sequence.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_reference
            ON payments(reference);
        CREATE INDEX IF NOT EXISTS idx_payments_due
            ON payments(payment_status, due_date);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (payment reference index)");
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
