//! CRUD operations for [`Message`] records and their read receipts.
//!
//! Read receipts live in their own table keyed by (message, reader), which
//! makes the bulk mark-read path idempotent: an `INSERT OR IGNORE` can never
//! record the same reader twice.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};
use uuid::Uuid;

use palaver_shared::model::{Attachment, Message, ReadReceipt, ReplyRef};
use palaver_shared::UserKind;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::row::{parse_json, parse_message_kind, parse_ts, parse_user_kind, parse_uuid};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_kind, sender_name, \
     sender_email, sender_profile, body, kind, attachments, reply_to, \
     is_edited, edited_at, is_deleted, deleted_at, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, sender_kind, sender_name,
                 sender_email, sender_profile, body, kind, attachments, reply_to,
                 is_edited, edited_at, is_deleted, deleted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id,
                message.sender_kind.as_str(),
                message.sender_name,
                message.sender_email,
                message.sender_profile,
                message.body,
                message.kind.as_str(),
                serde_json::to_string(&message.attachments)?,
                message
                    .reply_to
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                message.edited as i64,
                message.edited_at.map(|t| t.to_rfc3339()),
                message.deleted as i64,
                message.deleted_at.map(|t| t.to_rfc3339()),
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch one message by id, soft-deleted ones included.
    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        message.read_by = self.receipts_for(id)?;
        Ok(message)
    }

    /// Page through a conversation's visible messages in ascending order.
    ///
    /// `before` bounds the page for backwards pagination; the newest `limit`
    /// messages older than it are returned.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ? AND is_deleted = 0"
        );
        let mut args = vec![conversation_id.to_string()];
        if let Some(bound) = before {
            sql.push_str(" AND created_at < ?");
            args.push(bound.to_rfc3339());
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {limit}"));

        let mut messages = {
            let mut stmt = self.conn().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_message)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        // Oldest first for display.
        messages.reverse();

        for message in &mut messages {
            message.read_by = self.receipts_for(message.id)?;
        }
        Ok(messages)
    }

    /// Count of visible messages in a conversation.
    pub fn message_count(&self, conversation_id: Uuid) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND is_deleted = 0",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Messages in the conversation authored by someone else and not yet
    /// read by this identity.
    pub fn unread_count(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        kind: UserKind,
    ) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.is_deleted = 0
               AND NOT (m.sender_id = ?2 AND m.sender_kind = ?3)
               AND NOT EXISTS (SELECT 1 FROM read_receipts r
                                WHERE r.message_id = m.id
                                  AND r.user_id = ?2 AND r.user_kind = ?3)",
            params![conversation_id.to_string(), user_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Append a read receipt to every qualifying message in the
    /// conversation: authored by someone else, not soft-deleted, and not
    /// already read by this identity. When `message_ids` is given, only
    /// that subset is considered. Returns the ids that were marked.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        reader_id: &str,
        reader_kind: UserKind,
        reader_name: &str,
        message_ids: Option<&[Uuid]>,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if matches!(message_ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT m.id FROM messages m
             WHERE m.conversation_id = ?
               AND m.is_deleted = 0
               AND NOT (m.sender_id = ? AND m.sender_kind = ?)
               AND NOT EXISTS (SELECT 1 FROM read_receipts r
                                WHERE r.message_id = m.id
                                  AND r.user_id = ? AND r.user_kind = ?)",
        );
        let mut args = vec![
            conversation_id.to_string(),
            reader_id.to_string(),
            reader_kind.as_str().to_string(),
            reader_id.to_string(),
            reader_kind.as_str().to_string(),
        ];
        if let Some(ids) = message_ids {
            sql.push_str(" AND m.id IN (");
            sql.push_str(&vec!["?"; ids.len()].join(", "));
            sql.push(')');
            args.extend(ids.iter().map(Uuid::to_string));
        }

        let candidates = {
            let mut stmt = self.conn().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(Uuid::parse_str(&row?)?);
            }
            out
        };

        for id in &candidates {
            self.conn().execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, user_kind, user_name, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    reader_id,
                    reader_kind.as_str(),
                    reader_name,
                    read_at.to_rfc3339(),
                ],
            )?;
        }

        Ok(candidates)
    }

    /// Replace the body of a message and flag it edited.
    pub fn edit_message(&self, id: Uuid, body: &str, at: DateTime<Utc>) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages SET body = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1",
            params![id.to_string(), body, at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Soft-delete: the row stays but disappears from listings and counts.
    pub fn soft_delete_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?2 WHERE id = ?1",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn receipts_for(&self, message_id: Uuid) -> Result<Vec<ReadReceipt>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, user_kind, user_name, read_at
             FROM read_receipts
             WHERE message_id = ?1
             ORDER BY read_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_string()], row_to_receipt)?;

        let mut receipts = Vec::new();
        for row in rows {
            receipts.push(row?);
        }
        Ok(receipts)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_id_str: String = row.get(1)?;
    let sender_kind_str: String = row.get(3)?;
    let kind_str: String = row.get(8)?;
    let attachments_str: String = row.get(9)?;
    let reply_to_str: Option<String> = row.get(10)?;
    let edited_at_str: Option<String> = row.get(12)?;
    let deleted_at_str: Option<String> = row.get(14)?;
    let created_at_str: String = row.get(15)?;

    let reply_to = match reply_to_str {
        Some(raw) => Some(parse_json::<ReplyRef>(10, &raw)?),
        None => None,
    };
    let edited_at = match edited_at_str {
        Some(raw) => Some(parse_ts(12, &raw)?),
        None => None,
    };
    let deleted_at = match deleted_at_str {
        Some(raw) => Some(parse_ts(14, &raw)?),
        None => None,
    };

    Ok(Message {
        id: parse_uuid(0, &id_str)?,
        conversation_id: parse_uuid(1, &conversation_id_str)?,
        sender_id: row.get(2)?,
        sender_kind: parse_user_kind(3, &sender_kind_str)?,
        sender_name: row.get(4)?,
        sender_email: row.get(5)?,
        sender_profile: row.get(6)?,
        body: row.get(7)?,
        kind: parse_message_kind(8, &kind_str)?,
        attachments: parse_json::<Vec<Attachment>>(9, &attachments_str)?,
        read_by: Vec::new(),
        reply_to,
        edited: row.get::<_, i64>(11)? != 0,
        edited_at,
        deleted: row.get::<_, i64>(13)? != 0,
        deleted_at,
        created_at: parse_ts(15, &created_at_str)?,
    })
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadReceipt> {
    let kind_str: String = row.get(1)?;
    let read_at_str: String = row.get(3)?;

    Ok(ReadReceipt {
        user_id: row.get(0)?,
        user_kind: parse_user_kind(1, &kind_str)?,
        user_name: row.get(2)?,
        read_at: parse_ts(3, &read_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::model::{Conversation, ConversationKind, CreatorRef, MessageKind, Participant};
    use palaver_shared::Identity;

    fn identity(id: &str, kind: UserKind) -> Identity {
        Identity {
            id: id.to_string(),
            kind,
            name: format!("user {id}"),
            email: None,
            profile: None,
        }
    }

    fn seeded() -> (Database, Conversation, Identity, Identity) {
        let db = Database::open_in_memory().unwrap();
        let admin = identity("1", UserKind::Admin);
        let user = identity("2", UserKind::User);
        let conv = Conversation::new(
            ConversationKind::DirectMixed,
            None,
            None,
            vec![
                Participant::from_identity(&admin, Utc::now()),
                Participant::from_identity(&user, Utc::now()),
            ],
            CreatorRef {
                id: admin.id.clone(),
                kind: admin.kind,
                name: admin.name.clone(),
            },
        );
        db.insert_conversation(&conv).unwrap();
        (db, conv, admin, user)
    }

    fn send(db: &Database, conv: &Conversation, sender: &Identity, body: &str) -> Message {
        let msg = Message::new(conv.id, sender, body.to_string(), MessageKind::Text, None);
        db.insert_message(&msg).unwrap();
        msg
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (db, conv, admin, _) = seeded();
        let msg = send(&db, &conv, &admin, "hello there");

        let loaded = db.get_message(msg.id).unwrap();
        assert_eq!(loaded.body, "hello there");
        assert_eq!(loaded.sender_kind, UserKind::Admin);
        assert!(loaded.read_by.is_empty());
        assert!(!loaded.edited);
    }

    #[test]
    fn listing_is_ascending_and_skips_deleted() {
        let (db, conv, admin, user) = seeded();
        let first = send(&db, &conv, &admin, "first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = send(&db, &conv, &user, "second");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = send(&db, &conv, &admin, "third");

        db.soft_delete_message(second.id, Utc::now()).unwrap();

        let page = db.list_messages(conv.id, 50, None).unwrap();
        let ids: Vec<Uuid> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, third.id]);
        assert_eq!(db.message_count(conv.id).unwrap(), 2);
    }

    #[test]
    fn pagination_bound_is_exclusive() {
        let (db, conv, admin, _) = seeded();
        let first = send(&db, &conv, &admin, "first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = send(&db, &conv, &admin, "second");

        let page = db.list_messages(conv.id, 50, Some(second.created_at)).unwrap();
        let ids: Vec<Uuid> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id]);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (db, conv, admin, user) = seeded();
        let from_admin = send(&db, &conv, &admin, "ping");
        let own = send(&db, &conv, &user, "pong");

        assert_eq!(db.unread_count(conv.id, &user.id, user.kind).unwrap(), 1);

        let marked = db
            .mark_read(conv.id, &user.id, user.kind, &user.name, None, Utc::now())
            .unwrap();
        assert_eq!(marked, vec![from_admin.id]);

        // Second pass finds nothing new and appends nothing.
        let marked = db
            .mark_read(conv.id, &user.id, user.kind, &user.name, None, Utc::now())
            .unwrap();
        assert!(marked.is_empty());

        let loaded = db.get_message(from_admin.id).unwrap();
        assert_eq!(loaded.read_by.len(), 1);
        assert!(loaded.is_read_by(&user.id, user.kind));

        // Own messages never collect the sender's receipt.
        assert!(db.get_message(own.id).unwrap().read_by.is_empty());
        assert_eq!(db.unread_count(conv.id, &user.id, user.kind).unwrap(), 0);
    }

    #[test]
    fn mark_read_respects_explicit_ids() {
        let (db, conv, admin, user) = seeded();
        let first = send(&db, &conv, &admin, "first");
        let second = send(&db, &conv, &admin, "second");

        let marked = db
            .mark_read(
                conv.id,
                &user.id,
                user.kind,
                &user.name,
                Some(&[first.id]),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(marked, vec![first.id]);
        assert!(db.get_message(second.id).unwrap().read_by.is_empty());

        let marked = db
            .mark_read(conv.id, &user.id, user.kind, &user.name, Some(&[]), Utc::now())
            .unwrap();
        assert!(marked.is_empty());
    }

    #[test]
    fn mark_read_skips_deleted_messages() {
        let (db, conv, admin, user) = seeded();
        let msg = send(&db, &conv, &admin, "soon gone");
        db.soft_delete_message(msg.id, Utc::now()).unwrap();

        let marked = db
            .mark_read(conv.id, &user.id, user.kind, &user.name, None, Utc::now())
            .unwrap();
        assert!(marked.is_empty());
    }

    #[test]
    fn edit_flags_message() {
        let (db, conv, admin, _) = seeded();
        let msg = send(&db, &conv, &admin, "tpyo");

        let updated = db.edit_message(msg.id, "typo", Utc::now()).unwrap();
        assert_eq!(updated.body, "typo");
        assert!(updated.edited);
        assert!(updated.edited_at.is_some());

        assert!(matches!(
            db.edit_message(Uuid::new_v4(), "x", Utc::now()),
            Err(StoreError::NotFound)
        ));
    }
}
