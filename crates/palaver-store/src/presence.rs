//! Durable presence records.
//!
//! One row per identity, refreshed on every transition; last writer wins.
//! The guard against a stale disconnect flipping a newer connection offline
//! lives in the server's connection registry, not here.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use palaver_shared::model::PresenceRecord;
use palaver_shared::UserKind;

use crate::database::Database;
use crate::error::Result;
use crate::row::{parse_ts, parse_user_kind, parse_uuid};

impl Database {
    /// Record an identity as online on the given connection.
    pub fn set_online(
        &self,
        user_id: &str,
        kind: UserKind,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO presence (user_id, user_kind, is_online, connection_id, last_seen)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(user_id, user_kind) DO UPDATE SET
                 is_online = 1,
                 connection_id = excluded.connection_id,
                 last_seen = excluded.last_seen",
            params![
                user_id,
                kind.as_str(),
                connection_id.to_string(),
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record an identity as offline, clearing its connection handle.
    pub fn set_offline(&self, user_id: &str, kind: UserKind, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO presence (user_id, user_kind, is_online, connection_id, last_seen)
             VALUES (?1, ?2, 0, NULL, ?3)
             ON CONFLICT(user_id, user_kind) DO UPDATE SET
                 is_online = 0,
                 connection_id = NULL,
                 last_seen = excluded.last_seen",
            params![user_id, kind.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_presence(&self, user_id: &str, kind: UserKind) -> Result<Option<PresenceRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT user_id, user_kind, is_online, connection_id, last_seen
                 FROM presence
                 WHERE user_id = ?1 AND user_kind = ?2",
                params![user_id, kind.as_str()],
                row_to_presence,
            )
            .optional()?;
        Ok(record)
    }

    /// Delete presence rows idle since before `cutoff`. Cleanup safety net,
    /// independent of explicit offline transitions. Returns rows removed.
    pub fn purge_stale_presence(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM presence WHERE last_seen < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_presence(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let kind_str: String = row.get(1)?;
    let connection_id_str: Option<String> = row.get(3)?;
    let last_seen_str: String = row.get(4)?;

    let connection_id = match connection_id_str {
        Some(raw) => Some(parse_uuid(3, &raw)?),
        None => None,
    };

    Ok(PresenceRecord {
        user_id: row.get(0)?,
        user_kind: parse_user_kind(1, &kind_str)?,
        is_online: row.get::<_, i64>(2)? != 0,
        connection_id,
        last_seen: parse_ts(4, &last_seen_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_refresh_one_row() {
        let db = Database::open_in_memory().unwrap();
        let conn_id = Uuid::new_v4();

        db.set_online("7", UserKind::User, conn_id, Utc::now()).unwrap();
        let record = db.get_presence("7", UserKind::User).unwrap().unwrap();
        assert!(record.is_online);
        assert_eq!(record.connection_id, Some(conn_id));

        // A newer connection supersedes in place.
        let newer = Uuid::new_v4();
        db.set_online("7", UserKind::User, newer, Utc::now()).unwrap();
        let record = db.get_presence("7", UserKind::User).unwrap().unwrap();
        assert_eq!(record.connection_id, Some(newer));

        db.set_offline("7", UserKind::User, Utc::now()).unwrap();
        let record = db.get_presence("7", UserKind::User).unwrap().unwrap();
        assert!(!record.is_online);
        assert!(record.connection_id.is_none());
    }

    #[test]
    fn missing_identity_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_presence("7", UserKind::User).unwrap().is_none());
    }

    #[test]
    fn purge_removes_only_idle_rows() {
        let db = Database::open_in_memory().unwrap();
        let old = Utc::now() - chrono::Duration::hours(48);

        db.set_online("1", UserKind::Admin, Uuid::new_v4(), old).unwrap();
        db.set_online("2", UserKind::User, Uuid::new_v4(), Utc::now())
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(db.purge_stale_presence(cutoff).unwrap(), 1);

        assert!(db.get_presence("1", UserKind::Admin).unwrap().is_none());
        assert!(db.get_presence("2", UserKind::User).unwrap().is_some());
    }
}
