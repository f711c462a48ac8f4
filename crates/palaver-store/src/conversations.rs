//! CRUD operations for [`Conversation`] records and their participant lists.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use palaver_shared::model::{
    Conversation, ConversationKind, CreatorRef, LastMessageSummary, Participant,
};
use palaver_shared::UserKind;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::row::{parse_conversation_kind, parse_json, parse_ts, parse_user_kind, parse_uuid};

const CONVERSATION_COLUMNS: &str = "id, kind, name, description, created_by_id, \
     created_by_kind, created_by_name, last_message, is_active, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new conversation together with its participant list.
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let last_message = conversation
            .last_message_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO conversations (id, kind, name, description, created_by_id,
                 created_by_kind, created_by_name, last_message, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                conversation.id.to_string(),
                conversation.kind.as_str(),
                conversation.name,
                conversation.description,
                conversation.created_by.id,
                conversation.created_by.kind.as_str(),
                conversation.created_by.name,
                last_message,
                conversation.active as i64,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;

        for participant in &conversation.participants {
            self.insert_participant_row(conversation.id, participant)?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation (including archived ones) by id.
    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        let mut conversation = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        conversation.participants = self.participants_for(id)?;
        Ok(conversation)
    }

    /// List the active conversations an identity participates in, most
    /// recently updated first. `filter` restricts the result to one kind.
    pub fn conversations_for(
        &self,
        user_id: &str,
        kind: UserKind,
        filter: Option<ConversationKind>,
    ) -> Result<Vec<Conversation>> {
        let mut sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE is_active = 1
               AND id IN (SELECT conversation_id FROM participants
                           WHERE user_id = ?1 AND user_kind = ?2)"
        );
        if filter.is_some() {
            sql.push_str(" AND kind = ?3");
        }
        sql.push_str(" ORDER BY updated_at DESC");

        let mut conversations = {
            let mut stmt = self.conn().prepare(&sql)?;
            let rows = match filter {
                Some(f) => {
                    stmt.query_map(params![user_id, kind.as_str(), f.as_str()], row_to_conversation)?
                }
                None => stmt.query_map(params![user_id, kind.as_str()], row_to_conversation)?,
            };

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for conversation in &mut conversations {
            conversation.participants = self.participants_for(conversation.id)?;
        }
        Ok(conversations)
    }

    /// Look up an existing active direct conversation over an unordered
    /// participant pair. Used to deduplicate one-on-one creation.
    pub fn find_active_direct(
        &self,
        kind: ConversationKind,
        first_id: &str,
        second_id: &str,
    ) -> Result<Option<Conversation>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT c.id FROM conversations c
                 WHERE c.kind = ?1 AND c.is_active = 1
                   AND (SELECT COUNT(*) FROM participants p
                         WHERE p.conversation_id = c.id) = 2
                   AND EXISTS (SELECT 1 FROM participants p
                                WHERE p.conversation_id = c.id AND p.user_id = ?2)
                   AND EXISTS (SELECT 1 FROM participants p
                                WHERE p.conversation_id = c.id AND p.user_id = ?3)
                 LIMIT 1",
                params![kind.as_str(), first_id, second_id],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(raw) => Ok(Some(self.get_conversation(Uuid::parse_str(&raw)?)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Add a participant. Adding an existing member is a no-op.
    pub fn add_participant(&self, conversation_id: Uuid, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO participants
                 (conversation_id, user_id, user_kind, name, email, profile, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id.to_string(),
                participant.id,
                participant.kind.as_str(),
                participant.name,
                participant.email,
                participant.profile,
                participant.joined_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove a participant. Returns `false` when no such member existed.
    pub fn remove_participant(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        kind: UserKind,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND user_kind = ?3",
            params![conversation_id.to_string(), user_id, kind.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete: flip `is_active` off. The row and its messages stay.
    pub fn archive_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Refresh the denormalized last-message cache and bump `updated_at`.
    pub fn touch_last_message(
        &self,
        id: Uuid,
        summary: &LastMessageSummary,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET last_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(summary)?,
                at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn participants_for(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, user_kind, name, email, profile, joined_at
             FROM participants
             WHERE conversation_id = ?1
             ORDER BY joined_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    fn insert_participant_row(&self, conversation_id: Uuid, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO participants
                 (conversation_id, user_id, user_kind, name, email, profile, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id.to_string(),
                participant.id,
                participant.kind.as_str(),
                participant.name,
                participant.email,
                participant.profile,
                participant.joined_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let created_by_kind_str: String = row.get(5)?;
    let last_message_str: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    let last_message_summary = match last_message_str {
        Some(raw) => Some(parse_json::<LastMessageSummary>(7, &raw)?),
        None => None,
    };

    Ok(Conversation {
        id: parse_uuid(0, &id_str)?,
        kind: parse_conversation_kind(1, &kind_str)?,
        name: row.get(2)?,
        description: row.get(3)?,
        participants: Vec::new(),
        last_message_summary,
        created_by: CreatorRef {
            id: row.get(4)?,
            kind: parse_user_kind(5, &created_by_kind_str)?,
            name: row.get(6)?,
        },
        active: row.get::<_, i64>(8)? != 0,
        created_at: parse_ts(9, &created_at_str)?,
        updated_at: parse_ts(10, &updated_at_str)?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let kind_str: String = row.get(1)?;
    let joined_at_str: String = row.get(5)?;

    Ok(Participant {
        id: row.get(0)?,
        kind: parse_user_kind(1, &kind_str)?,
        name: row.get(2)?,
        email: row.get(3)?,
        profile: row.get(4)?,
        joined_at: parse_ts(5, &joined_at_str)?,
    })
}
