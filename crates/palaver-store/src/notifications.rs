//! CRUD operations for [`Notification`] records.
//!
//! Rows are created by the fan-out path for unreachable participants and
//! drained on reconnect. There is deliberately no uniqueness constraint on
//! (user, message): the check-then-create path is not atomic with message
//! persistence, and a rare duplicate is tolerated over losing a wake-up.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};
use uuid::Uuid;

use palaver_shared::model::{Notification, NotificationPayload};
use palaver_shared::UserKind;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::row::{parse_notification_kind, parse_ts, parse_user_kind, parse_uuid};

const NOTIFICATION_COLUMNS: &str = "id, user_id, user_kind, kind, conversation_id, message_id, \
     is_read, delivered_at, read_at, sender_name, excerpt, conversation_name, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.conn().execute(
            "INSERT INTO notifications (id, user_id, user_kind, kind, conversation_id,
                 message_id, is_read, delivered_at, read_at, sender_name, excerpt,
                 conversation_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                notification.id.to_string(),
                notification.user_id,
                notification.user_kind.as_str(),
                notification.kind.as_str(),
                notification.conversation_id.to_string(),
                notification.message_id.map(|id| id.to_string()),
                notification.is_read as i64,
                notification.delivered_at.map(|t| t.to_rfc3339()),
                notification.read_at.map(|t| t.to_rfc3339()),
                notification.payload.sender_name,
                notification.payload.excerpt,
                notification.payload.conversation_name,
                notification.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Unacknowledged notifications for an identity, newest first.
    pub fn unread_notifications(
        &self,
        user_id: &str,
        kind: UserKind,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 AND user_kind = ?2 AND is_read = 0
             ORDER BY created_at DESC
             LIMIT {limit}"
        ))?;

        let rows = stmt.query_map(params![user_id, kind.as_str()], row_to_notification)?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    /// All notifications for an identity, newest first, paginated.
    pub fn list_notifications(
        &self,
        user_id: &str,
        kind: UserKind,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 AND user_kind = ?2
             ORDER BY created_at DESC
             LIMIT {limit} OFFSET {offset}"
        ))?;

        let rows = stmt.query_map(params![user_id, kind.as_str()], row_to_notification)?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    pub fn notification_count(&self, user_id: &str, kind: UserKind) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND user_kind = ?2",
            params![user_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Stamp `delivered_at` on the given rows, first delivery only: rows
    /// already carrying a delivery timestamp keep it. Returns how many rows
    /// were stamped.
    pub fn stamp_delivered(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut sql = String::from(
            "UPDATE notifications SET delivered_at = ? WHERE delivered_at IS NULL AND id IN (",
        );
        sql.push_str(&vec!["?"; ids.len()].join(", "));
        sql.push(')');

        let mut args = vec![at.to_rfc3339()];
        args.extend(ids.iter().map(Uuid::to_string));

        let affected = self.conn().execute(&sql, params_from_iter(args.iter()))?;
        Ok(affected)
    }

    /// Acknowledge a single notification. Scoped to the owning identity so
    /// one user cannot acknowledge another's rows.
    pub fn mark_notification_read(
        &self,
        id: Uuid,
        user_id: &str,
        kind: UserKind,
        at: DateTime<Utc>,
    ) -> Result<Notification> {
        let affected = self.conn().execute(
            "UPDATE notifications SET is_read = 1, read_at = ?4
             WHERE id = ?1 AND user_id = ?2 AND user_kind = ?3",
            params![id.to_string(), user_id, kind.as_str(), at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.conn()
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                params![id.to_string()],
                row_to_notification,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Acknowledge everything outstanding for an identity. Returns the
    /// number of rows that flipped.
    pub fn mark_all_notifications_read(
        &self,
        user_id: &str,
        kind: UserKind,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE notifications SET is_read = 1, read_at = ?3
             WHERE user_id = ?1 AND user_kind = ?2 AND is_read = 0",
            params![user_id, kind.as_str(), at.to_rfc3339()],
        )?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn delete_notification(&self, id: Uuid, user_id: &str, kind: UserKind) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2 AND user_kind = ?3",
            params![id.to_string(), user_id, kind.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id_str: String = row.get(0)?;
    let user_kind_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let conversation_id_str: String = row.get(4)?;
    let message_id_str: Option<String> = row.get(5)?;
    let delivered_at_str: Option<String> = row.get(7)?;
    let read_at_str: Option<String> = row.get(8)?;
    let created_at_str: String = row.get(12)?;

    let message_id = match message_id_str {
        Some(raw) => Some(parse_uuid(5, &raw)?),
        None => None,
    };
    let delivered_at = match delivered_at_str {
        Some(raw) => Some(parse_ts(7, &raw)?),
        None => None,
    };
    let read_at = match read_at_str {
        Some(raw) => Some(parse_ts(8, &raw)?),
        None => None,
    };

    Ok(Notification {
        id: parse_uuid(0, &id_str)?,
        user_id: row.get(1)?,
        user_kind: parse_user_kind(2, &user_kind_str)?,
        kind: parse_notification_kind(3, &kind_str)?,
        conversation_id: parse_uuid(4, &conversation_id_str)?,
        message_id,
        is_read: row.get::<_, i64>(6)? != 0,
        delivered_at,
        read_at,
        payload: NotificationPayload {
            sender_name: row.get(9)?,
            excerpt: row.get(10)?,
            conversation_name: row.get(11)?,
        },
        created_at: parse_ts(12, &created_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::model::NotificationKind;

    fn notification(user_id: &str) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            user_kind: UserKind::User,
            kind: NotificationKind::NewMessage,
            conversation_id: Uuid::new_v4(),
            message_id: Some(Uuid::new_v4()),
            is_read: false,
            delivered_at: None,
            read_at: None,
            payload: NotificationPayload {
                sender_name: "Ana".to_string(),
                excerpt: "hi".to_string(),
                conversation_name: None,
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_list_unread() {
        let db = Database::open_in_memory().unwrap();
        let n = notification("2");
        db.insert_notification(&n).unwrap();
        db.insert_notification(&notification("3")).unwrap();

        let unread = db.unread_notifications("2", UserKind::User, 50).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, n.id);
        assert_eq!(unread[0].payload.excerpt, "hi");
        assert!(unread[0].delivered_at.is_none());
    }

    #[test]
    fn delivery_stamp_is_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        let n = notification("2");
        db.insert_notification(&n).unwrap();

        let first = Utc::now();
        assert_eq!(db.stamp_delivered(&[n.id], first).unwrap(), 1);

        // Re-delivery after a reconnect must not move the timestamp.
        let later = first + chrono::Duration::seconds(60);
        assert_eq!(db.stamp_delivered(&[n.id], later).unwrap(), 0);

        let loaded = &db.unread_notifications("2", UserKind::User, 50).unwrap()[0];
        assert_eq!(
            loaded.delivered_at.unwrap().to_rfc3339(),
            first.to_rfc3339()
        );
        // Delivery alone does not acknowledge.
        assert!(!loaded.is_read);
    }

    #[test]
    fn acknowledgment_is_scoped_and_final() {
        let db = Database::open_in_memory().unwrap();
        let n = notification("2");
        db.insert_notification(&n).unwrap();

        // Another identity cannot acknowledge it.
        assert!(matches!(
            db.mark_notification_read(n.id, "9", UserKind::User, Utc::now()),
            Err(StoreError::NotFound)
        ));

        let updated = db
            .mark_notification_read(n.id, "2", UserKind::User, Utc::now())
            .unwrap();
        assert!(updated.is_read);
        assert!(updated.read_at.is_some());

        assert!(db.unread_notifications("2", UserKind::User, 50).unwrap().is_empty());
    }

    #[test]
    fn mark_all_flips_only_unread() {
        let db = Database::open_in_memory().unwrap();
        let a = notification("2");
        let b = notification("2");
        db.insert_notification(&a).unwrap();
        db.insert_notification(&b).unwrap();
        db.mark_notification_read(a.id, "2", UserKind::User, Utc::now())
            .unwrap();

        assert_eq!(
            db.mark_all_notifications_read("2", UserKind::User, Utc::now())
                .unwrap(),
            1
        );
        assert_eq!(
            db.mark_all_notifications_read("2", UserKind::User, Utc::now())
                .unwrap(),
            0
        );
    }

    #[test]
    fn listing_paginates() {
        let db = Database::open_in_memory().unwrap();
        for _ in 0..5 {
            db.insert_notification(&notification("2")).unwrap();
        }

        assert_eq!(db.notification_count("2", UserKind::User).unwrap(), 5);
        assert_eq!(db.list_notifications("2", UserKind::User, 2, 0).unwrap().len(), 2);
        assert_eq!(db.list_notifications("2", UserKind::User, 2, 4).unwrap().len(), 1);
    }

    #[test]
    fn delete_is_scoped() {
        let db = Database::open_in_memory().unwrap();
        let n = notification("2");
        db.insert_notification(&n).unwrap();

        assert!(matches!(
            db.delete_notification(n.id, "9", UserKind::User),
            Err(StoreError::NotFound)
        ));
        db.delete_notification(n.id, "2", UserKind::User).unwrap();
        assert_eq!(db.notification_count("2", UserKind::User).unwrap(), 0);
    }
}
