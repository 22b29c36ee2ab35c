use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientMessageId, GroupId, MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Stable reference to an uploaded attachment, as returned by the upload
/// service. The original filename is kept for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub filename: String,
}

/// Denormalized snapshot of the replied-to message, captured at send time.
/// Immutable afterwards so the reply still renders if the original message
/// is later edited or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub message_id: MessageId,
    pub sender_name: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    #[serde(default)]
    pub edited: bool,
    pub created_at: DateTime<Utc>,
}

/// The sender-provided half of a message. The hub assigns the canonical
/// identifier and timestamp and captures the reply snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

impl MessageDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            body: Some(body.into()),
            attachment: None,
            reply_to: None,
        }
    }

    pub fn media(kind: MessageKind, attachment: AttachmentRef) -> Self {
        Self {
            kind,
            body: None,
            attachment: Some(attachment),
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Join {
        group_id: GroupId,
    },
    Send {
        group_id: GroupId,
        client_message_id: ClientMessageId,
        draft: MessageDraft,
    },
    Edit {
        message_id: MessageId,
        new_body: String,
    },
    Delete {
        message_id: MessageId,
    },
    MarkSeen {
        group_id: GroupId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageEdited {
        group_id: GroupId,
        message_id: MessageId,
        new_body: String,
    },
    MessageDeleted {
        group_id: GroupId,
        message_id: MessageId,
    },
    Joined {
        group_id: GroupId,
    },
    /// A send was rejected before persistence; delivered only to the
    /// originating session so it can fail the matching pending entry.
    SendRejected {
        client_message_id: ClientMessageId,
        error: ApiError,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub creator_id: UserId,
}

/// One row of the conversation-list screen: the group, its newest message
/// and how many messages the viewer has not seen yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOverview {
    pub group: GroupSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub unread_count: i64,
}

/// History page plus the caller's read state, fetched once when a
/// conversation is opened. Messages are ascending by acceptance order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_state: Option<DateTime<Utc>>,
}
