//! Tenancy assignment and lifecycle for The Small PMS.
//!
//! A tenancy links one lodger, one property, and one room, and drives the
//! room's status transitions (available → reserved → occupied → available).
//! Assignment spawns the payment obligations and a notification to the
//! lodger.
//!
//! **Rules:**
//! - A room can only be assigned while `available`; the whole assignment is
//!   one `BEGIN IMMEDIATE` transaction, so a failed step leaves nothing
//!   behind and concurrent assignments cannot double-book a room or commit
//!   duplicate payment references.
//! - Rent and deposit amounts come from the room; the payload cannot
//!   override them.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::notifications::insert_notification;
use crate::payments::insert_payment;
use crate::properties::room_snapshot;

// ---------------------------------------------------------------------------
// Assign tenancy
// ---------------------------------------------------------------------------

/// Assign a room to a lodger.
///
/// Creates a `pending` tenancy, flips the room to `reserved`, inserts a
/// deposit payment and a rent payment where their amounts are non-zero
/// (each with a fresh reference, due on the start date), and notifies the
/// lodger. All in one transaction.
pub fn assign_tenancy(db: &DbState, payload: &Value) -> Result<Value, String> {
    let lodger_id = req_str(payload, "lodgerId")?;
    let property_id = req_str(payload, "propertyId")?;
    let room_id = req_str(payload, "roomId")?;
    let start_date = req_str(payload, "startDate")?;
    let end_date = str_field(payload, "endDate").filter(|s| !s.trim().is_empty());

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // Room amounts are read-only inputs fetched from the registry
    let (room_property, room_status, monthly_rent, deposit_amount) =
        room_snapshot(&conn, &room_id)?;
    if room_property != property_id {
        return Err("Room does not belong to the selected property".into());
    }
    if room_status != "available" {
        return Err(format!(
            "Room is not available (current status: {room_status})"
        ));
    }

    let tenancy_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(Option<String>, Option<String>), String> {
        conn.execute(
            "INSERT INTO tenancies (
                id, lodger_id, property_id, room_id, start_date, end_date,
                tenancy_status, deposit_status, monthly_rent, deposit_amount,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 'unpaid', ?7, ?8, ?9, ?9)",
            params![
                tenancy_id,
                lodger_id,
                property_id,
                room_id,
                start_date,
                end_date,
                monthly_rent,
                deposit_amount,
                now,
            ],
        )
        .map_err(|e| format!("Tenancy Error: {e}"))?;

        conn.execute(
            "UPDATE rooms SET room_status = 'reserved', updated_at = ?1 WHERE id = ?2",
            params![now, room_id],
        )
        .map_err(|e| format!("Room Update Error: {e}"))?;

        let deposit_reference = if deposit_amount > 0.0 {
            let (_, reference) =
                insert_payment(&conn, &tenancy_id, "deposit", deposit_amount, &start_date)
                    .map_err(|e| format!("Deposit Error: {e}"))?;
            Some(reference)
        } else {
            None
        };

        let rent_reference = if monthly_rent > 0.0 {
            let (_, reference) =
                insert_payment(&conn, &tenancy_id, "rent", monthly_rent, &start_date)
                    .map_err(|e| format!("Rent Error: {e}"))?;
            Some(reference)
        } else {
            None
        };

        insert_notification(
            &conn,
            &lodger_id,
            "Tenancy assigned",
            &format!("Your tenancy starting {start_date} has been created"),
            "tenancy",
        )
        .map_err(|e| format!("Notification Error: {e}"))?;

        Ok((deposit_reference, rent_reference))
    })();

    let (deposit_reference, rent_reference) = match result {
        Ok(refs) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            refs
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        tenancy_id = %tenancy_id,
        lodger_id = %lodger_id,
        room_id = %room_id,
        rent = %monthly_rent,
        deposit = %deposit_amount,
        "Tenancy assigned"
    );

    Ok(serde_json::json!({
        "success": true,
        "tenancyId": tenancy_id,
        "depositReference": deposit_reference,
        "rentReference": rent_reference,
        "message": "Tenancy created",
    }))
}

// ---------------------------------------------------------------------------
// Activate
// ---------------------------------------------------------------------------

/// Move a pending tenancy to active and its room from reserved to occupied.
pub fn activate_tenancy(db: &DbState, tenancy_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (status, room_id): (String, String) = conn
        .query_row(
            "SELECT tenancy_status, room_id FROM tenancies WHERE id = ?1",
            params![tenancy_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Tenancy not found: {tenancy_id}"))?;

    if status != "pending" {
        return Err(format!(
            "Only pending tenancies can be activated (current status: {status})"
        ));
    }

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "UPDATE tenancies SET tenancy_status = 'active', updated_at = ?1 WHERE id = ?2",
            params![now, tenancy_id],
        )
        .map_err(|e| format!("Tenancy Update Error: {e}"))?;

        conn.execute(
            "UPDATE rooms SET room_status = 'occupied', updated_at = ?1 WHERE id = ?2",
            params![now, room_id],
        )
        .map_err(|e| format!("Room Update Error: {e}"))?;

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

    info!(tenancy_id = %tenancy_id, "Tenancy activated");

    Ok(serde_json::json!({
        "success": true,
        "tenancyId": tenancy_id,
        "tenancyStatus": "active",
    }))
}

// ---------------------------------------------------------------------------
// Query tenancies
// ---------------------------------------------------------------------------

/// The "Tenancy Records" list: all tenancies joined with property and room.
pub fn list_tenancies(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.lodger_id, t.property_id, t.room_id, t.start_date, t.end_date,
                    t.tenancy_status, t.deposit_status, t.monthly_rent, t.deposit_amount,
                    t.created_at, t.updated_at, p.name, r.room_number
             FROM tenancies t
             JOIN properties p ON p.id = t.property_id
             JOIN rooms r ON r.id = t.room_id
             ORDER BY t.created_at DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "lodgerId": row.get::<_, String>(1)?,
                "propertyId": row.get::<_, String>(2)?,
                "roomId": row.get::<_, String>(3)?,
                "startDate": row.get::<_, String>(4)?,
                "endDate": row.get::<_, Option<String>>(5)?,
                "tenancyStatus": row.get::<_, String>(6)?,
                "depositStatus": row.get::<_, String>(7)?,
                "monthlyRent": row.get::<_, f64>(8)?,
                "depositAmount": row.get::<_, f64>(9)?,
                "createdAt": row.get::<_, String>(10)?,
                "updatedAt": row.get::<_, String>(11)?,
                "propertyName": row.get::<_, String>(12)?,
                "roomNumber": row.get::<_, String>(13)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut tenancies = Vec::new();
    for row in rows {
        match row {
            Ok(t) => tenancies.push(t),
            Err(e) => warn!("skipping malformed tenancy row: {e}"),
        }
    }

    Ok(serde_json::json!(tenancies))
}

/// Get a single tenancy with property and room detail.
pub fn get_tenancy(db: &DbState, tenancy_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    conn.query_row(
        "SELECT t.id, t.lodger_id, t.property_id, t.room_id, t.start_date, t.end_date,
                t.tenancy_status, t.deposit_status, t.monthly_rent, t.deposit_amount,
                t.created_at, t.updated_at, p.name, r.room_number
         FROM tenancies t
         JOIN properties p ON p.id = t.property_id
         JOIN rooms r ON r.id = t.room_id
         WHERE t.id = ?1",
        params![tenancy_id],
        |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "lodgerId": row.get::<_, String>(1)?,
                "propertyId": row.get::<_, String>(2)?,
                "roomId": row.get::<_, String>(3)?,
                "startDate": row.get::<_, String>(4)?,
                "endDate": row.get::<_, Option<String>>(5)?,
                "tenancyStatus": row.get::<_, String>(6)?,
                "depositStatus": row.get::<_, String>(7)?,
                "monthlyRent": row.get::<_, f64>(8)?,
                "depositAmount": row.get::<_, f64>(9)?,
                "createdAt": row.get::<_, String>(10)?,
                "updatedAt": row.get::<_, String>(11)?,
                "propertyName": row.get::<_, String>(12)?,
                "roomNumber": row.get::<_, String>(13)?,
            }))
        },
    )
    .map_err(|_| format!("Tenancy not found: {tenancy_id}"))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Explicit admin delete of a tenancy record (audit-free).
///
/// Payments and deposit-ledger rows cascade. If the tenancy was still
/// pending/active its room is freed in the same transaction.
pub fn delete_tenancy(db: &DbState, tenancy_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (status, room_id): (String, String) = conn
        .query_row(
            "SELECT tenancy_status, room_id FROM tenancies WHERE id = ?1",
            params![tenancy_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Tenancy not found: {tenancy_id}"))?;

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute("DELETE FROM tenancies WHERE id = ?1", params![tenancy_id])
            .map_err(|e| format!("Tenancy Delete Error: {e}"))?;

        if status == "pending" || status == "active" {
            conn.execute(
                "UPDATE rooms SET room_status = 'available', updated_at = ?1 WHERE id = ?2",
                params![now, room_id],
            )
            .map_err(|e| format!("Room Update Error: {e}"))?;
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

    warn!(tenancy_id = %tenancy_id, status = %status, "Tenancy deleted by admin");

    Ok(serde_json::json!({
        "success": true,
        "tenancyId": tenancy_id,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

/// Required non-empty string field.
fn req_str(v: &Value, key: &str) -> Result<String, String> {
    match str_field(v, key) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(format!("Missing {key}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
