//! Payment records and reference generation for The Small PMS.
//!
//! Payments are financial obligations (`deposit` or `rent`) tied to a
//! tenancy. Rows are created by the tenancy-assignment workflow; this module
//! owns the reference generator and the status transitions the dashboard's
//! payment screen drives.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;

/// Statuses the dashboard may set on a payment.
const VALID_PAYMENT_STATUSES: &[&str] = &["pending", "completed", "cancelled", "failed", "overdue"];

// ---------------------------------------------------------------------------
// Reference generation
// ---------------------------------------------------------------------------

/// Generate a sequential payment reference in format PAY-YYYYMMDD-NNNN.
///
/// Scans existing references with today's prefix, takes the highest numeric
/// suffix, and adds one; the first reference of a day is `0001`. Suffixes
/// that fail to parse are skipped.
///
/// The scan is read-then-increment, so it must run inside the caller's
/// `BEGIN IMMEDIATE` transaction; SQLite then serializes concurrent
/// assignments and two callers cannot commit the same reference.
pub(crate) fn next_payment_reference(conn: &Connection) -> Result<String, String> {
    let stamp = chrono::Local::now().format("%Y%m%d").to_string();
    next_reference_for(conn, &stamp)
}

/// Reference generation for a specific day stamp (YYYYMMDD).
fn next_reference_for(conn: &Connection, stamp: &str) -> Result<String, String> {
    let prefix = format!("PAY-{stamp}-");

    let mut stmt = conn
        .prepare("SELECT reference FROM payments WHERE reference LIKE ?1")
        .map_err(|e| format!("reference scan: {e}"))?;
    let rows = stmt
        .query_map(params![format!("{prefix}%")], |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| format!("reference scan: {e}"))?;

    let mut max_seq: u32 = 0;
    for row in rows {
        let reference = match row {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed reference row: {e}");
                continue;
            }
        };
        if let Some(suffix) = reference.strip_prefix(&prefix) {
            if let Ok(seq) = suffix.parse::<u32>() {
                max_seq = max_seq.max(seq);
            }
        }
    }

    Ok(format!("PAY-{stamp}-{:04}", max_seq + 1))
}

// ---------------------------------------------------------------------------
// Payment creation (called from workflow transactions)
// ---------------------------------------------------------------------------

/// Insert a pending payment for a tenancy with a freshly generated reference.
///
/// Connection-level so the assignment workflow can call it inside its
/// transaction. Returns `(payment_id, reference)`.
pub(crate) fn insert_payment(
    conn: &Connection,
    tenancy_id: &str,
    payment_type: &str,
    amount: f64,
    due_date: &str,
) -> Result<(String, String), String> {
    let payment_id = Uuid::new_v4().to_string();
    let reference = next_payment_reference(conn)?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO payments (
            id, tenancy_id, payment_type, amount, payment_status,
            reference, due_date, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?7)",
        params![payment_id, tenancy_id, payment_type, amount, reference, due_date, now],
    )
    .map_err(|e| format!("insert payment: {e}"))?;

    Ok((payment_id, reference))
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Update a payment's status.
///
/// Marking a deposit payment `completed` also moves the tenancy's
/// deposit_status to `held` and stamps `paid_at`.
pub fn update_payment_status(
    db: &DbState,
    payment_id: &str,
    status: &str,
) -> Result<Value, String> {
    if !VALID_PAYMENT_STATUSES.contains(&status) {
        return Err(format!(
            "Invalid payment status: {status}. Must be one of {VALID_PAYMENT_STATUSES:?}"
        ));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (tenancy_id, payment_type): (String, String) = conn
        .query_row(
            "SELECT tenancy_id, payment_type FROM payments WHERE id = ?1",
            params![payment_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Payment not found: {payment_id}"))?;

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        if status == "completed" {
            conn.execute(
                "UPDATE payments SET payment_status = ?1, paid_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![status, now, payment_id],
            )
            .map_err(|e| format!("update payment: {e}"))?;
        } else {
            conn.execute(
                "UPDATE payments SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, now, payment_id],
            )
            .map_err(|e| format!("update payment: {e}"))?;
        }

        // A collected deposit moves the tenancy's deposit into "held"
        if status == "completed" && payment_type == "deposit" {
            conn.execute(
                "UPDATE tenancies SET deposit_status = 'held', updated_at = ?1 WHERE id = ?2",
                params![now, tenancy_id],
            )
            .map_err(|e| format!("update tenancy deposit status: {e}"))?;
        }

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(payment_id = %payment_id, status = %status, "Payment status updated");

    Ok(serde_json::json!({
        "success": true,
        "paymentId": payment_id,
        "status": status,
    }))
}

/// Back-office sweep: mark pending payments past their due date as overdue.
///
/// Returns the number of payments flipped.
pub fn mark_overdue_payments(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let now = Utc::now().to_rfc3339();

    let flipped = conn
        .execute(
            "UPDATE payments SET payment_status = 'overdue', updated_at = ?1
             WHERE payment_status = 'pending' AND due_date IS NOT NULL AND due_date < ?2",
            params![now, today],
        )
        .map_err(|e| format!("mark overdue: {e}"))?;

    if flipped > 0 {
        info!(count = flipped, "Marked overdue payments");
    }

    Ok(serde_json::json!({
        "success": true,
        "markedOverdue": flipped,
    }))
}

// ---------------------------------------------------------------------------
// Query payments
// ---------------------------------------------------------------------------

/// Get all payments for a tenancy, newest first.
pub fn list_tenancy_payments(db: &DbState, tenancy_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, tenancy_id, payment_type, amount, payment_status,
                    reference, due_date, paid_at, created_at, updated_at
             FROM payments
             WHERE tenancy_id = ?1
             ORDER BY created_at DESC, reference DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![tenancy_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "tenancyId": row.get::<_, String>(1)?,
                "paymentType": row.get::<_, String>(2)?,
                "amount": row.get::<_, f64>(3)?,
                "paymentStatus": row.get::<_, String>(4)?,
                "reference": row.get::<_, String>(5)?,
                "dueDate": row.get::<_, Option<String>>(6)?,
                "paidAt": row.get::<_, Option<String>>(7)?,
                "createdAt": row.get::<_, String>(8)?,
                "updatedAt": row.get::<_, String>(9)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut payments = Vec::new();
    for row in rows {
        match row {
            Ok(p) => payments.push(p),
            Err(e) => warn!("skipping malformed payment row: {e}"),
        }
    }

    Ok(serde_json::json!(payments))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    /// Insert a property, room, and tenancy; returns the tenancy id.
    fn seed_tenancy(db: &DbState, tenancy_id: &str) -> String {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO properties (id, name, address_line1, city, postcode, capacity)
             VALUES ('prop-1', 'Elm House', '1 Elm St', 'Dublin', 'D01', 8)",
            [],
        )
        .unwrap();
        let room_id = format!("room-{tenancy_id}");
        conn.execute(
            "INSERT INTO rooms (id, property_id, room_number, monthly_rent, deposit_amount)
             VALUES (?1, 'prop-1', ?1, 400.0, 500.0)",
            params![room_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tenancies (id, lodger_id, property_id, room_id, start_date,
                                    monthly_rent, deposit_amount)
             VALUES (?1, 'user-1', 'prop-1', ?2, '2026-01-01', 400.0, 500.0)",
            params![tenancy_id, room_id],
        )
        .unwrap();
        tenancy_id.to_string()
    }

    fn seed_reference(db: &DbState, tenancy_id: &str, n: u32, reference: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference)
             VALUES (?1, ?2, 'rent', 100.0, ?3)",
            params![format!("pay-{tenancy_id}-{n}"), tenancy_id, reference],
        )
        .unwrap();
    }

    #[test]
    fn test_first_reference_of_day() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let reference = next_reference_for(&conn, "20260115").unwrap();
        assert_eq!(reference, "PAY-20260115-0001");
    }

    #[test]
    fn test_reference_continues_sequence() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-seq");
        for n in 1..=7 {
            seed_reference(&db, &ten, n, &format!("PAY-20260115-{n:04}"));
        }

        let conn = db.conn.lock().unwrap();
        let reference = next_reference_for(&conn, "20260115").unwrap();
        assert_eq!(reference, "PAY-20260115-0008");
    }

    #[test]
    fn test_reference_ignores_other_days_and_bad_suffixes() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-mix");
        seed_reference(&db, &ten, 1, "PAY-20260114-0042");
        seed_reference(&db, &ten, 2, "PAY-20260115-0003");
        seed_reference(&db, &ten, 3, "PAY-20260115-draft");

        let conn = db.conn.lock().unwrap();
        let reference = next_reference_for(&conn, "20260115").unwrap();
        assert_eq!(reference, "PAY-20260115-0004");
    }

    #[test]
    fn test_scan_alone_is_read_then_increment() {
        // Without an intervening insert, two scans return the same value.
        // This is why the generator must run inside the caller's
        // BEGIN IMMEDIATE transaction.
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let a = next_reference_for(&conn, "20260115").unwrap();
        let b = next_reference_for(&conn, "20260115").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_update_status_invalid_rejected() {
        let db = test_db();
        let err = update_payment_status(&db, "pay-x", "paid").unwrap_err();
        assert!(err.contains("Invalid payment status"));
    }

    #[test]
    fn test_update_status_missing_payment() {
        let db = test_db();
        let err = update_payment_status(&db, "pay-missing", "completed").unwrap_err();
        assert!(err.contains("Payment not found"));
    }

    #[test]
    fn test_deposit_completed_marks_tenancy_held() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-dep");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference)
                 VALUES ('pay-dep', ?1, 'deposit', 500.0, 'PAY-20260101-0001')",
                params![ten],
            )
            .unwrap();
        }

        update_payment_status(&db, "pay-dep", "completed").unwrap();

        let conn = db.conn.lock().unwrap();
        let (pay_status, paid_at): (String, Option<String>) = conn
            .query_row(
                "SELECT payment_status, paid_at FROM payments WHERE id = 'pay-dep'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(pay_status, "completed");
        assert!(paid_at.is_some(), "paid_at should be stamped");

        let deposit_status: String = conn
            .query_row(
                "SELECT deposit_status FROM tenancies WHERE id = ?1",
                params![ten],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(deposit_status, "held");
    }

    #[test]
    fn test_rent_completed_leaves_deposit_status() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-rent");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference)
                 VALUES ('pay-rent', ?1, 'rent', 400.0, 'PAY-20260101-0002')",
                params![ten],
            )
            .unwrap();
        }

        update_payment_status(&db, "pay-rent", "completed").unwrap();

        let conn = db.conn.lock().unwrap();
        let deposit_status: String = conn
            .query_row(
                "SELECT deposit_status FROM tenancies WHERE id = ?1",
                params![ten],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(deposit_status, "unpaid");
    }

    #[test]
    fn test_mark_overdue_sweep() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-od");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference, due_date)
                 VALUES ('pay-past', ?1, 'rent', 400.0, 'PAY-20200101-0001', '2020-01-01')",
                params![ten],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference, due_date)
                 VALUES ('pay-future', ?1, 'rent', 400.0, 'PAY-20200101-0002', '2099-01-01')",
                params![ten],
            )
            .unwrap();
        }

        let result = mark_overdue_payments(&db).unwrap();
        assert_eq!(result["markedOverdue"], 1);

        let conn = db.conn.lock().unwrap();
        let past: String = conn
            .query_row(
                "SELECT payment_status FROM payments WHERE id = 'pay-past'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(past, "overdue");
        let future: String = conn
            .query_row(
                "SELECT payment_status FROM payments WHERE id = 'pay-future'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(future, "pending");
    }

    #[test]
    fn test_list_tenancy_payments() {
        let db = test_db();
        let ten = seed_tenancy(&db, "ten-list");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference, created_at)
                 VALUES ('pay-a', ?1, 'deposit', 500.0, 'PAY-20260101-0001', '2026-01-01T10:00:00Z')",
                params![ten],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO payments (id, tenancy_id, payment_type, amount, reference, created_at)
                 VALUES ('pay-b', ?1, 'rent', 400.0, 'PAY-20260102-0001', '2026-01-02T10:00:00Z')",
                params![ten],
            )
            .unwrap();
        }

        let result = list_tenancy_payments(&db, &ten).unwrap();
        let payments = result.as_array().unwrap();
        assert_eq!(payments.len(), 2);
        // Most recent first
        assert_eq!(payments[0]["id"], "pay-b");
        assert_eq!(payments[1]["id"], "pay-a");
    }
}
