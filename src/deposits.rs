//! Move-out and deposit disposition for The Small PMS.
//!
//! At vacate time the operator chooses what happens to the security deposit:
//! `refund` (full), `partial` (deduct a specified amount, refund the rest),
//! or `retain` (deduct everything). Deductions are recorded as rows in the
//! generic `extra_charges` ledger tagged `deposit_deduction`.
//!
//! **Rules:**
//! - A zero or still-unpaid deposit skips all financial processing; the
//!   tenancy is only closed.
//! - The ledger insert is checked — if it lands no row the move-out aborts
//!   and the tenancy stays open.
//! - Everything runs in one `BEGIN IMMEDIATE` transaction: close tenancy,
//!   free room, write ledger, notify the lodger, or none of it.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::notifications::insert_notification;

/// Ledger tag for deposit deductions in `extra_charges`.
const DEPOSIT_DEDUCTION: &str = "deposit_deduction";

// ---------------------------------------------------------------------------
// Move out
// ---------------------------------------------------------------------------

/// Close a tenancy and settle its deposit.
///
/// Payload: `tenancyId`, `endDate`, `depositAction` ∈
/// {refund, partial, retain}, `deductionAmount` (partial only), optional
/// `reason` and `evicted` flag. The reported `remainingRefund` is
/// `max(0, deposit − deduction)` — display only, never persisted.
pub fn move_out(db: &DbState, payload: &Value) -> Result<Value, String> {
    let tenancy_id = req_str(payload, "tenancyId")?;
    let end_date = req_str(payload, "endDate")?;
    let deposit_action = req_str(payload, "depositAction")?;
    if !matches!(deposit_action.as_str(), "refund" | "partial" | "retain") {
        return Err(format!(
            "Invalid depositAction: {deposit_action}. Must be refund, partial, or retain"
        ));
    }
    let evicted = payload
        .get("evicted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let reason = str_field(payload, "reason").unwrap_or_else(|| "Deposit deduction".to_string());

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (lodger_id, tenancy_status, deposit_status, deposit_amount, room_id): (
        String,
        String,
        String,
        f64,
        String,
    ) = conn
        .query_row(
            "SELECT lodger_id, tenancy_status, deposit_status, deposit_amount, room_id
             FROM tenancies WHERE id = ?1",
            params![tenancy_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .map_err(|_| format!("Tenancy not found: {tenancy_id}"))?;

    if tenancy_status != "pending" && tenancy_status != "active" {
        return Err(format!(
            "Tenancy is already closed (current status: {tenancy_status})"
        ));
    }

    // A zero or never-collected deposit gets no financial processing,
    // whatever action the operator picked.
    let skip_financial = deposit_amount <= 0.0 || deposit_status == "unpaid";

    let (deduction, new_deposit_status) = if skip_financial {
        (0.0, deposit_status.clone())
    } else {
        match deposit_action.as_str() {
            "refund" => (0.0, "refunded".to_string()),
            "partial" => {
                let amount = num_field(payload, "deductionAmount")
                    .ok_or("Missing deductionAmount for partial deduction")?;
                if amount <= 0.0 {
                    return Err("Deduction amount must be positive".into());
                }
                if amount > deposit_amount {
                    return Err(format!(
                        "Deduction {amount:.2} exceeds deposit {deposit_amount:.2}"
                    ));
                }
                (amount, "partially_deducted".to_string())
            }
            // retain deducts the full deposit
            _ => (deposit_amount, "retained".to_string()),
        }
    };

    let remaining_refund = (deposit_amount - deduction).max(0.0);
    let final_status = if evicted { "evicted" } else { "ended" };
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        if deduction > 0.0 {
            let charge_id = Uuid::new_v4().to_string();
            let inserted = conn
                .execute(
                    "INSERT INTO extra_charges (
                        id, tenancy_id, charge_type, amount, reason, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![charge_id, tenancy_id, DEPOSIT_DEDUCTION, deduction, reason, now],
                )
                .map_err(|e| format!("Deposit Deduction Error: {e}"))?;
            // The tenancy must not close without its ledger row
            if inserted == 0 {
                return Err("Deposit Deduction Error: ledger insert affected no rows".into());
            }
        }

        conn.execute(
            "UPDATE tenancies SET
                tenancy_status = ?1, end_date = ?2, deposit_status = ?3, updated_at = ?4
             WHERE id = ?5",
            params![final_status, end_date, new_deposit_status, now, tenancy_id],
        )
        .map_err(|e| format!("Tenancy Update Error: {e}"))?;

        conn.execute(
            "UPDATE rooms SET room_status = 'available', updated_at = ?1 WHERE id = ?2",
            params![now, room_id],
        )
        .map_err(|e| format!("Room Update Error: {e}"))?;

        let message = if skip_financial {
            format!("Your tenancy ended on {end_date}")
        } else if deduction > 0.0 {
            format!(
                "Your tenancy ended on {end_date}. {deduction:.2} was deducted from your deposit; {remaining_refund:.2} will be refunded"
            )
        } else {
            format!(
                "Your tenancy ended on {end_date}. Your deposit of {deposit_amount:.2} will be refunded in full"
            )
        };
        insert_notification(&conn, &lodger_id, "Tenancy ended", &message, "tenancy")
            .map_err(|e| format!("Notification Error: {e}"))?;

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

    info!(
        tenancy_id = %tenancy_id,
        action = %deposit_action,
        deduction = %deduction,
        status = %final_status,
        "Move-out completed"
    );

    Ok(serde_json::json!({
        "success": true,
        "tenancyId": tenancy_id,
        "tenancyStatus": final_status,
        "depositStatus": new_deposit_status,
        "deductionAmount": deduction,
        "remainingRefund": remaining_refund,
    }))
}

// ---------------------------------------------------------------------------
// Deposit ledger view
// ---------------------------------------------------------------------------

/// The deposit ledger for a tenancy: all deduction rows newest-first plus
/// the computed refund total. Pure read.
pub fn get_deposit_summary(db: &DbState, tenancy_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (deposit_amount, deposit_status): (f64, String) = conn
        .query_row(
            "SELECT deposit_amount, deposit_status FROM tenancies WHERE id = ?1",
            params![tenancy_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Tenancy not found: {tenancy_id}"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, amount, reason, created_at
             FROM extra_charges
             WHERE tenancy_id = ?1 AND charge_type = ?2
             ORDER BY created_at DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![tenancy_id, DEPOSIT_DEDUCTION], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "amount": row.get::<_, f64>(1)?,
                "reason": row.get::<_, Option<String>>(2)?,
                "createdAt": row.get::<_, String>(3)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut deductions = Vec::new();
    let mut total_deducted = 0.0;
    for row in rows {
        match row {
            Ok(d) => {
                total_deducted += d["amount"].as_f64().unwrap_or(0.0);
                deductions.push(d);
            }
            Err(e) => warn!("skipping malformed charge row: {e}"),
        }
    }

    let refunded = (deposit_amount - total_deducted).max(0.0);

    Ok(serde_json::json!({
        "tenancyId": tenancy_id,
        "depositAmount": deposit_amount,
        "depositStatus": deposit_status,
        "totalDeducted": total_deducted,
        "refunded": refunded,
        "deductions": deductions,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
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
