//! In-app notification emitter for The Small PMS.
//!
//! Notifications are fire-and-forget rows the dashboard displays to a user.
//! Delivery and read tracking live elsewhere; the workflows here only ever
//! insert.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;

/// Insert a notification row on an existing connection.
///
/// Connection-level so workflows can emit inside their own transactions.
/// Returns the new notification id.
pub(crate) fn insert_notification(
    conn: &Connection,
    user_id: &str,
    title: &str,
    message: &str,
    notification_type: &str,
) -> Result<String, String> {
    let notification_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO notifications (id, user_id, title, message, notification_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![notification_id, user_id, title, message, notification_type, now],
    )
    .map_err(|e| format!("insert notification: {e}"))?;

    Ok(notification_id)
}

/// Emit a standalone notification.
pub fn emit_notification(db: &DbState, payload: &Value) -> Result<Value, String> {
    let user_id = str_field(payload, "userId")
        .or_else(|| str_field(payload, "user_id"))
        .ok_or("Missing userId")?;
    let title = str_field(payload, "title").ok_or("Missing title")?;
    let message = str_field(payload, "message").ok_or("Missing message")?;
    let notification_type = str_field(payload, "type")
        .or_else(|| str_field(payload, "notificationType"))
        .unwrap_or_else(|| "general".to_string());

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let notification_id =
        insert_notification(&conn, &user_id, &title, &message, &notification_type)?;

    info!(notification_id = %notification_id, user_id = %user_id, "Notification emitted");

    Ok(serde_json::json!({
        "success": true,
        "notificationId": notification_id,
    }))
}

/// Get all notifications for a user, newest first.
pub fn list_user_notifications(db: &DbState, user_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, user_id, title, message, notification_type, is_read, created_at
             FROM notifications
             WHERE user_id = ?1
             ORDER BY created_at DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "userId": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "message": row.get::<_, String>(3)?,
                "notificationType": row.get::<_, String>(4)?,
                "isRead": row.get::<_, i64>(5)? != 0,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut notifications = Vec::new();
    for row in rows {
        match row {
            Ok(n) => notifications.push(n),
            Err(e) => warn!("skipping malformed notification row: {e}"),
        }
    }

    Ok(serde_json::json!(notifications))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
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

    #[test]
    fn test_emit_requires_user() {
        let db = test_db();
        let payload = serde_json::json!({ "title": "Hi", "message": "There" });
        let err = emit_notification(&db, &payload).unwrap_err();
        assert!(err.contains("Missing userId"));
    }

    #[test]
    fn test_emit_and_list() {
        let db = test_db();

        let p1 = serde_json::json!({
            "userId": "user-1",
            "title": "Tenancy assigned",
            "message": "Room 1A reserved for you",
            "type": "tenancy",
        });
        emit_notification(&db, &p1).unwrap();

        let p2 = serde_json::json!({
            "userId": "user-1",
            "title": "Deposit refunded",
            "message": "Your deposit of 500.00 will be refunded",
        });
        emit_notification(&db, &p2).unwrap();

        // A different user's notification must not leak into the list
        let p3 = serde_json::json!({
            "userId": "user-2",
            "title": "Other",
            "message": "Other user",
        });
        emit_notification(&db, &p3).unwrap();

        let result = list_user_notifications(&db, "user-1").unwrap();
        let notifications = result.as_array().unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0]["notificationType"], "general");
        assert_eq!(notifications[1]["notificationType"], "tenancy");
        assert_eq!(notifications[0]["isRead"], false);
    }
}
