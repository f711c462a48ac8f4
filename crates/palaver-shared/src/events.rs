//! WebSocket event protocol.
//!
//! Both directions speak JSON envelopes of the form
//! `{"event": "<name>", "data": {...}}`, modeled as adjacently tagged
//! enums. Events without a payload omit the `data` key entirely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::UserKind;
use crate::model::{ConversationKind, LastMessageSummary, Message, MessageKind, Notification, ReplyRef};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Join one room per active conversation the caller participates in.
    JoinConversations,
    JoinConversation {
        conversation_id: Uuid,
    },
    LeaveConversation {
        conversation_id: Uuid,
    },
    SendMessage {
        conversation_id: Uuid,
        message: String,
        #[serde(default)]
        message_type: MessageKind,
        #[serde(default)]
        reply_to: Option<ReplyRef>,
    },
    TypingStart {
        conversation_id: Uuid,
    },
    TypingStop {
        conversation_id: Uuid,
    },
    MarkRead {
        conversation_id: Uuid,
        #[serde(default)]
        message_ids: Option<Vec<Uuid>>,
    },
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Conversation context attached to a `new_message` broadcast so clients
/// can refresh their list entry without a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub last_message_summary: Option<LastMessageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ConversationsJoined {
        success: bool,
        count: usize,
    },
    ConversationJoined {
        success: bool,
        conversation_id: Uuid,
    },
    NewMessage {
        message: Message,
        conversation: ConversationRef,
    },
    /// Acknowledgment to the sender only; peers see `new_message`.
    MessageSent {
        success: bool,
        message: Message,
    },
    UserTyping {
        conversation_id: Uuid,
        user_id: String,
        user_kind: UserKind,
        user_name: String,
        is_typing: bool,
    },
    MessagesRead {
        conversation_id: Uuid,
        user_id: String,
        user_kind: UserKind,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
    MarkReadSuccess {
        success: bool,
        conversation_id: Uuid,
    },
    /// Global presence broadcast, not room-scoped.
    UserStatus {
        user_id: String,
        user_kind: UserKind,
        user_name: String,
        is_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    PendingNotifications {
        notifications: Vec<Notification>,
        count: usize,
    },
    Error {
        message: String,
    },
}
