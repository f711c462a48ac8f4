//! Domain model structs persisted by `palaver-store`.
//!
//! Every struct derives `Serialize`/`Deserialize` with the camelCase field
//! names the clients expect, so store rows can be handed straight to the
//! REST and WebSocket layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{Identity, IdentityKey, UserKind};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Conversation shape: one-on-one between two admins, one-on-one between an
/// admin and a user, or a named group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationKind {
    DirectAdmin,
    DirectMixed,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::DirectAdmin => "direct-admin",
            ConversationKind::DirectMixed => "direct-mixed",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct-admin" => Some(ConversationKind::DirectAdmin),
            "direct-mixed" => Some(ConversationKind::DirectMixed),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }

    /// Direct conversations hold exactly two participants.
    pub fn is_direct(&self) -> bool {
        !matches!(self, ConversationKind::Group)
    }
}

/// One member of a conversation's participant list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub kind: UserKind,
    pub name: String,
    pub email: Option<String>,
    pub profile: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn from_identity(identity: &Identity, joined_at: DateTime<Utc>) -> Self {
        Self {
            id: identity.id.clone(),
            kind: identity.kind,
            name: identity.name.clone(),
            email: identity.email.clone(),
            profile: identity.profile.clone(),
            joined_at,
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.id.clone(), self.kind)
    }
}

/// Denormalized preview of the most recent message, cached on the
/// conversation. The message collection is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageSummary {
    pub body: String,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Who created a conversation. Deletion and participant management are
/// restricted to the creator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatorRef {
    pub id: String,
    pub kind: UserKind,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message_summary: Option<LastMessageSummary>,
    pub created_by: CreatorRef,
    /// Soft-delete flag. Archived conversations keep their rows.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        kind: ConversationKind,
        name: Option<String>,
        description: Option<String>,
        participants: Vec<Participant>,
        created_by: CreatorRef,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            name,
            description,
            participants,
            last_message_summary: None,
            created_by,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, user_id: &str, kind: UserKind) -> bool {
        self.participants
            .iter()
            .any(|p| p.id == user_id && p.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// A file or image attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// A single read receipt appended by the read-receipt aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: String,
    pub user_kind: UserKind,
    pub user_name: String,
    pub read_at: DateTime<Utc>,
}

/// Reference to the message being replied to, denormalized so clients can
/// render the quote without a second fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub message_id: Uuid,
    pub excerpt: Option<String>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub sender_kind: UserKind,
    pub sender_name: String,
    pub sender_email: Option<String>,
    pub sender_profile: Option<String>,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub read_by: Vec<ReadReceipt>,
    pub reply_to: Option<ReplyRef>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a fresh message from a resolved sender. `read_by` starts empty;
    /// the sender's own receipt is never recorded.
    pub fn new(
        conversation_id: Uuid,
        sender: &Identity,
        body: String,
        kind: MessageKind,
        reply_to: Option<ReplyRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender.id.clone(),
            sender_kind: sender.kind,
            sender_name: sender.name.clone(),
            sender_email: sender.email.clone(),
            sender_profile: sender.profile.clone(),
            body,
            kind,
            attachments: Vec::new(),
            read_by: Vec::new(),
            reply_to,
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_read_by(&self, user_id: &str, kind: UserKind) -> bool {
        self.read_by
            .iter()
            .any(|r| r.user_id == user_id && r.user_kind == kind)
    }

    pub fn summary(&self) -> LastMessageSummary {
        LastMessageSummary {
            body: self.body.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            timestamp: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    NewConversation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewMessage => "new_message",
            NotificationKind::NewConversation => "new_conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_message" => Some(NotificationKind::NewMessage),
            "new_conversation" => Some(NotificationKind::NewConversation),
            _ => None,
        }
    }
}

/// Human-readable context carried inside a notification so the client can
/// render it without loading the conversation or message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub sender_name: String,
    pub excerpt: String,
    pub conversation_name: Option<String>,
}

/// A durably queued notification for a participant who was not reachable
/// live when the triggering event happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub user_kind: UserKind,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub is_read: bool,
    /// Set the first time the notification is pushed to a live connection.
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new_message(
        recipient: &IdentityKey,
        conversation: &Conversation,
        message: &Message,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: recipient.user_id.clone(),
            user_kind: recipient.kind,
            kind: NotificationKind::NewMessage,
            conversation_id: conversation.id,
            message_id: Some(message.id),
            is_read: false,
            delivered_at: None,
            read_at: None,
            payload: NotificationPayload {
                sender_name: message.sender_name.clone(),
                excerpt: message.body.clone(),
                conversation_name: conversation.name.clone(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn new_conversation(recipient: &IdentityKey, conversation: &Conversation) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: recipient.user_id.clone(),
            user_kind: recipient.kind,
            kind: NotificationKind::NewConversation,
            conversation_id: conversation.id,
            message_id: None,
            is_read: false,
            delivered_at: None,
            read_at: None,
            payload: NotificationPayload {
                sender_name: conversation.created_by.name.clone(),
                excerpt: String::new(),
                conversation_name: conversation.name.clone(),
            },
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Durable last-known presence of one identity. One row per identity,
/// last-writer-wins, expired by the server's purge task after a bounded
/// idle period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_kind: UserKind,
    pub is_online: bool,
    pub connection_id: Option<Uuid>,
    pub last_seen: DateTime<Utc>,
}
