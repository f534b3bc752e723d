//! Property and room registry for The Small PMS.
//!
//! Properties hold rooms; rooms carry the rent and deposit amounts the
//! tenancy workflow reads at assignment time. Room status must reflect at
//! most one pending/active tenancy, which the guards here and in the
//! assignment transaction enforce together.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;

const VALID_PROPERTY_STATUSES: &[&str] =
    &["active", "inactive", "under_maintenance", "pending_approval"];
const VALID_ROOM_STATUSES: &[&str] = &["available", "reserved", "occupied", "under_maintenance"];

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Create a property.
pub fn create_property(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = req_str(payload, "name")?;
    let address_line1 = req_str(payload, "addressLine1")?;
    let address_line2 = str_field(payload, "addressLine2");
    let city = req_str(payload, "city")?;
    let postcode = req_str(payload, "postcode")?;
    let landlord_id = str_field(payload, "landlordId");

    let capacity = payload
        .get("capacity")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    if capacity < 1 {
        return Err("Capacity must be at least 1".into());
    }

    let status = str_field(payload, "status").unwrap_or_else(|| "active".to_string());
    if !VALID_PROPERTY_STATUSES.contains(&status.as_str()) {
        return Err(format!(
            "Invalid property status: {status}. Must be one of {VALID_PROPERTY_STATUSES:?}"
        ));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let property_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO properties (
            id, name, address_line1, address_line2, city, postcode,
            capacity, status, landlord_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            property_id,
            name,
            address_line1,
            address_line2,
            city,
            postcode,
            capacity,
            status,
            landlord_id,
            now,
        ],
    )
    .map_err(|e| format!("insert property: {e}"))?;

    info!(property_id = %property_id, name = %name, "Property created");

    Ok(serde_json::json!({
        "success": true,
        "propertyId": property_id,
    }))
}

/// Update a property's address fields, capacity, or status.
///
/// Fields absent from the payload are left unchanged.
pub fn update_property(db: &DbState, payload: &Value) -> Result<Value, String> {
    let property_id = str_field(payload, "propertyId")
        .or_else(|| str_field(payload, "id"))
        .ok_or("Missing propertyId")?;

    if let Some(status) = str_field(payload, "status") {
        if !VALID_PROPERTY_STATUSES.contains(&status.as_str()) {
            return Err(format!(
                "Invalid property status: {status}. Must be one of {VALID_PROPERTY_STATUSES:?}"
            ));
        }
    }
    if let Some(capacity) = payload.get("capacity").and_then(Value::as_i64) {
        if capacity < 1 {
            return Err("Capacity must be at least 1".into());
        }
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = Utc::now().to_rfc3339();

    let updated = conn
        .execute(
            "UPDATE properties SET
                name = COALESCE(?1, name),
                address_line1 = COALESCE(?2, address_line1),
                address_line2 = COALESCE(?3, address_line2),
                city = COALESCE(?4, city),
                postcode = COALESCE(?5, postcode),
                capacity = COALESCE(?6, capacity),
                status = COALESCE(?7, status),
                updated_at = ?8
             WHERE id = ?9",
            params![
                str_field(payload, "name"),
                str_field(payload, "addressLine1"),
                str_field(payload, "addressLine2"),
                str_field(payload, "city"),
                str_field(payload, "postcode"),
                payload.get("capacity").and_then(Value::as_i64),
                str_field(payload, "status"),
                now,
                property_id,
            ],
        )
        .map_err(|e| format!("update property: {e}"))?;

    if updated == 0 {
        return Err(format!("Property not found: {property_id}"));
    }

    info!(property_id = %property_id, "Property updated");

    Ok(serde_json::json!({
        "success": true,
        "propertyId": property_id,
    }))
}

/// List all properties with room and occupancy counts.
pub fn list_properties(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.name, p.address_line1, p.address_line2, p.city, p.postcode,
                    p.capacity, p.status, p.landlord_id, p.created_at, p.updated_at,
                    COUNT(r.id),
                    COALESCE(SUM(CASE WHEN r.room_status = 'occupied' THEN 1 ELSE 0 END), 0)
             FROM properties p
             LEFT JOIN rooms r ON r.property_id = p.id
             GROUP BY p.id
             ORDER BY p.name",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "addressLine1": row.get::<_, String>(2)?,
                "addressLine2": row.get::<_, Option<String>>(3)?,
                "city": row.get::<_, String>(4)?,
                "postcode": row.get::<_, String>(5)?,
                "capacity": row.get::<_, i64>(6)?,
                "status": row.get::<_, String>(7)?,
                "landlordId": row.get::<_, Option<String>>(8)?,
                "createdAt": row.get::<_, String>(9)?,
                "updatedAt": row.get::<_, String>(10)?,
                "roomCount": row.get::<_, i64>(11)?,
                "occupiedCount": row.get::<_, i64>(12)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut properties = Vec::new();
    for row in rows {
        match row {
            Ok(p) => properties.push(p),
            Err(e) => warn!("skipping malformed property row: {e}"),
        }
    }

    Ok(serde_json::json!(properties))
}

/// Delete a property. Rooms cascade; rejected while any tenancy — live or
/// historical — still references the property. Historical records go
/// through the explicit admin tenancy delete first.
pub fn delete_property(db: &DbState, property_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let live_tenancies: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tenancies
             WHERE property_id = ?1 AND tenancy_status IN ('pending', 'active')",
            params![property_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("tenancy check: {e}"))?;
    if live_tenancies > 0 {
        return Err(format!(
            "Cannot delete property with {live_tenancies} pending/active tenancies"
        ));
    }

    let tenancy_refs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tenancies WHERE property_id = ?1",
            params![property_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("tenancy check: {e}"))?;
    if tenancy_refs > 0 {
        return Err(format!(
            "Cannot delete property referenced by {tenancy_refs} tenancy records; delete them first"
        ));
    }

    let deleted = conn
        .execute("DELETE FROM properties WHERE id = ?1", params![property_id])
        .map_err(|e| format!("delete property: {e}"))?;
    if deleted == 0 {
        return Err(format!("Property not found: {property_id}"));
    }

    info!(property_id = %property_id, "Property deleted");

    Ok(serde_json::json!({
        "success": true,
        "propertyId": property_id,
    }))
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// Create a room under a property.
///
/// Rejected when the property is already at capacity or the room number is
/// taken within the property.
pub fn create_room(db: &DbState, payload: &Value) -> Result<Value, String> {
    let property_id = str_field(payload, "propertyId")
        .or_else(|| str_field(payload, "property_id"))
        .ok_or("Missing propertyId")?;
    let room_number = req_str(payload, "roomNumber")?;

    let monthly_rent = num_field(payload, "monthlyRent")
        .or_else(|| num_field(payload, "monthly_rent"))
        .unwrap_or(0.0);
    let deposit_amount = num_field(payload, "depositAmount")
        .or_else(|| num_field(payload, "deposit_amount"))
        .unwrap_or(0.0);
    if monthly_rent < 0.0 || deposit_amount < 0.0 {
        return Err("Rent and deposit amounts cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let capacity: i64 = conn
        .query_row(
            "SELECT capacity FROM properties WHERE id = ?1",
            params![property_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Property not found: {property_id}"))?;

    let room_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM rooms WHERE property_id = ?1",
            params![property_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("room count: {e}"))?;
    if room_count >= capacity {
        return Err(format!(
            "Property is at capacity ({room_count}/{capacity} rooms)"
        ));
    }

    let room_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO rooms (
            id, property_id, room_number, room_status,
            monthly_rent, deposit_amount, created_at, updated_at
        ) VALUES (?1, ?2, ?3, 'available', ?4, ?5, ?6, ?6)",
        params![room_id, property_id, room_number, monthly_rent, deposit_amount, now],
    )
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            format!("Room number {room_number} already exists in this property")
        } else {
            format!("insert room: {e}")
        }
    })?;

    info!(room_id = %room_id, property_id = %property_id, room_number = %room_number, "Room created");

    Ok(serde_json::json!({
        "success": true,
        "roomId": room_id,
    }))
}

/// Update a room's number, rent, or deposit. Absent fields are unchanged.
pub fn update_room(db: &DbState, payload: &Value) -> Result<Value, String> {
    let room_id = str_field(payload, "roomId")
        .or_else(|| str_field(payload, "id"))
        .ok_or("Missing roomId")?;

    let monthly_rent = num_field(payload, "monthlyRent");
    let deposit_amount = num_field(payload, "depositAmount");
    if monthly_rent.is_some_and(|r| r < 0.0) || deposit_amount.is_some_and(|d| d < 0.0) {
        return Err("Rent and deposit amounts cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = Utc::now().to_rfc3339();

    let updated = conn
        .execute(
            "UPDATE rooms SET
                room_number = COALESCE(?1, room_number),
                monthly_rent = COALESCE(?2, monthly_rent),
                deposit_amount = COALESCE(?3, deposit_amount),
                updated_at = ?4
             WHERE id = ?5",
            params![
                str_field(payload, "roomNumber"),
                monthly_rent,
                deposit_amount,
                now,
                room_id,
            ],
        )
        .map_err(|e| format!("update room: {e}"))?;

    if updated == 0 {
        return Err(format!("Room not found: {room_id}"));
    }

    info!(room_id = %room_id, "Room updated");

    Ok(serde_json::json!({
        "success": true,
        "roomId": room_id,
    }))
}

/// Manually set a room's status (maintenance toggles).
///
/// Rejected while a pending/active tenancy references the room — those
/// transitions belong to the tenancy workflow.
pub fn set_room_status(db: &DbState, room_id: &str, status: &str) -> Result<Value, String> {
    if !VALID_ROOM_STATUSES.contains(&status) {
        return Err(format!(
            "Invalid room status: {status}. Must be one of {VALID_ROOM_STATUSES:?}"
        ));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let live_tenancies: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tenancies
             WHERE room_id = ?1 AND tenancy_status IN ('pending', 'active')",
            params![room_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("tenancy check: {e}"))?;
    if live_tenancies > 0 {
        return Err("Room has a pending/active tenancy; end it before changing status".into());
    }

    let now = Utc::now().to_rfc3339();
    let updated = conn
        .execute(
            "UPDATE rooms SET room_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, room_id],
        )
        .map_err(|e| format!("update room status: {e}"))?;
    if updated == 0 {
        return Err(format!("Room not found: {room_id}"));
    }

    info!(room_id = %room_id, status = %status, "Room status set");

    Ok(serde_json::json!({
        "success": true,
        "roomId": room_id,
        "roomStatus": status,
    }))
}

/// List a property's rooms with the current (pending/active) tenancy id, if any.
pub fn list_rooms(db: &DbState, property_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.property_id, r.room_number, r.room_status,
                    r.monthly_rent, r.deposit_amount, r.created_at, r.updated_at,
                    t.id
             FROM rooms r
             LEFT JOIN tenancies t
                ON t.room_id = r.id AND t.tenancy_status IN ('pending', 'active')
             WHERE r.property_id = ?1
             ORDER BY r.room_number",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![property_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "propertyId": row.get::<_, String>(1)?,
                "roomNumber": row.get::<_, String>(2)?,
                "roomStatus": row.get::<_, String>(3)?,
                "monthlyRent": row.get::<_, f64>(4)?,
                "depositAmount": row.get::<_, f64>(5)?,
                "createdAt": row.get::<_, String>(6)?,
                "updatedAt": row.get::<_, String>(7)?,
                "currentTenancyId": row.get::<_, Option<String>>(8)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut rooms = Vec::new();
    for row in rows {
        match row {
            Ok(r) => rooms.push(r),
            Err(e) => warn!("skipping malformed room row: {e}"),
        }
    }

    Ok(serde_json::json!(rooms))
}

/// Delete a room. Rejected while any tenancy (of any status) references it.
pub fn delete_room(db: &DbState, room_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let tenancy_refs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tenancies WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("tenancy check: {e}"))?;
    if tenancy_refs > 0 {
        return Err(format!(
            "Cannot delete room referenced by {tenancy_refs} tenancies"
        ));
    }

    let deleted = conn
        .execute("DELETE FROM rooms WHERE id = ?1", params![room_id])
        .map_err(|e| format!("delete room: {e}"))?;
    if deleted == 0 {
        return Err(format!("Room not found: {room_id}"));
    }

    info!(room_id = %room_id, "Room deleted");

    Ok(serde_json::json!({
        "success": true,
        "roomId": room_id,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fetch a room's property, status, and amounts (assignment workflow input).
pub(crate) fn room_snapshot(
    conn: &Connection,
    room_id: &str,
) -> Result<(String, String, f64, f64), String> {
    conn.query_row(
        "SELECT property_id, room_status, monthly_rent, deposit_amount
         FROM rooms WHERE id = ?1",
        params![room_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
    .map_err(|_| format!("Room not found: {room_id}"))
}

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
