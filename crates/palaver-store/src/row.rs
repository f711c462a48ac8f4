//! Row-decoding helpers shared by the CRUD modules.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use uuid::Uuid;

use palaver_shared::model::{ConversationKind, MessageKind, NotificationKind};
use palaver_shared::UserKind;

pub(crate) fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_user_kind(idx: usize, s: &str) -> rusqlite::Result<UserKind> {
    UserKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown user kind: {s}").into(),
        )
    })
}

pub(crate) fn parse_conversation_kind(idx: usize, s: &str) -> rusqlite::Result<ConversationKind> {
    ConversationKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown conversation kind: {s}").into(),
        )
    })
}

pub(crate) fn parse_message_kind(idx: usize, s: &str) -> rusqlite::Result<MessageKind> {
    MessageKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown message kind: {s}").into(),
        )
    })
}

pub(crate) fn parse_notification_kind(idx: usize, s: &str) -> rusqlite::Result<NotificationKind> {
    NotificationKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown notification kind: {s}").into(),
        )
    })
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
