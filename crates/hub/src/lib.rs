//! Broadcast hub: the single authoritative mediator per group room.
//!
//! Only the hub assigns canonical message identifiers and timestamps and
//! writes to the store. Writes for one group are serialized behind a
//! per-room guard so every subscribed session observes the same order;
//! different groups proceed in parallel.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{ClientMessageId, GroupId, MessageId, MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AttachmentRef, MessageDraft, MessagePayload, ReplySnapshot, ServerEvent},
};
use storage::{NewMessage, Storage, StoredAttachment, StoredMessage, StoredReply};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Events buffered per room before slow sessions start lagging.
const ROOM_CHANNEL_CAPACITY: usize = 256;
/// Reply previews are clipped to this many characters at snapshot time.
const REPLY_PREVIEW_MAX_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient delivery failure: {0}")]
    TransientDelivery(#[source] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl From<&HubError> for ApiError {
    fn from(value: &HubError) -> Self {
        let code = match value {
            HubError::Forbidden(_) => ErrorCode::Forbidden,
            HubError::Validation(_) => ErrorCode::Validation,
            HubError::NotFound(_) => ErrorCode::NotFound,
            HubError::TransientDelivery(_) => ErrorCode::TransientDelivery,
            HubError::Internal(_) => ErrorCode::Internal,
        };
        ApiError::new(code, value.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(value: HubError) -> Self {
        ApiError::from(&value)
    }
}

struct Room {
    events: broadcast::Sender<ServerEvent>,
    /// Serializes validate → persist → fan-out for this group so message
    /// identifiers and broadcast order agree.
    write_guard: Mutex<()>,
}

impl Room {
    fn new() -> Self {
        let (events, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            events,
            write_guard: Mutex::new(()),
        }
    }
}

pub struct Hub {
    storage: Storage,
    rooms: RwLock<HashMap<GroupId, Arc<Room>>>,
}

impl Hub {
    pub fn new(storage: Storage) -> Arc<Self> {
        Arc::new(Self {
            storage,
            rooms: RwLock::new(HashMap::new()),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    async fn room(&self, group_id: GroupId) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&group_id) {
                return Arc::clone(room);
            }
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(group_id).or_insert_with(|| Arc::new(Room::new())))
    }

    async fn ensure_member(&self, group_id: GroupId, user_id: UserId) -> Result<(), HubError> {
        if self
            .storage
            .group_meta(group_id)
            .await
            .map_err(HubError::Internal)?
            .is_none()
        {
            return Err(HubError::NotFound(format!("group {} not found", group_id.0)));
        }
        let member = self
            .storage
            .is_member(group_id, user_id)
            .await
            .map_err(HubError::Internal)?;
        if !member {
            return Err(HubError::Forbidden(format!(
                "user {} is not a member of group {}",
                user_id.0, group_id.0
            )));
        }
        Ok(())
    }

    /// Subscribes a session to a room. Membership criteria are checked on
    /// every join; the receiver delivers all subsequent room events in
    /// acceptance order.
    pub async fn join(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<broadcast::Receiver<ServerEvent>, HubError> {
        self.ensure_member(group_id, user_id).await?;
        let room = self.room(group_id).await;
        debug!(group_id = group_id.0, user_id = user_id.0, "session joined room");
        Ok(room.events.subscribe())
    }

    /// Validates, persists and fans out one message. A resend carrying an
    /// already-persisted correlation token returns the existing message
    /// without a second broadcast, giving at-most-once delivery.
    pub async fn send(
        &self,
        user_id: UserId,
        group_id: GroupId,
        client_message_id: &ClientMessageId,
        draft: &MessageDraft,
    ) -> Result<MessagePayload, HubError> {
        let room = self.room(group_id).await;
        let _write = room.write_guard.lock().await;

        self.ensure_member(group_id, user_id).await?;

        if let Some(existing) = self
            .storage
            .find_message_by_client_id(group_id, user_id, client_message_id)
            .await
            .map_err(HubError::Internal)?
        {
            info!(
                group_id = group_id.0,
                user_id = user_id.0,
                message_id = existing.message_id.0,
                "resend matched persisted message; returning existing"
            );
            let sender_name = self.sender_name(user_id).await;
            return Ok(to_payload(existing, sender_name));
        }

        validate_draft(draft)?;
        let reply = match draft.reply_to {
            Some(target_id) => Some(self.snapshot_reply(group_id, target_id).await?),
            None => None,
        };

        let created_at = Utc::now();
        let attachment = draft.attachment.as_ref().map(|a| StoredAttachment {
            url: a.url.clone(),
            filename: a.filename.clone(),
        });
        let message_id = self
            .storage
            .insert_message(NewMessage {
                group_id,
                sender_id: user_id,
                client_message_id,
                kind: draft.kind,
                body: draft.body.as_deref(),
                attachment: attachment.as_ref(),
                reply: reply.as_ref(),
                created_at,
            })
            .await
            .map_err(HubError::TransientDelivery)?;

        let sender_name = self.sender_name(user_id).await;
        let payload = MessagePayload {
            message_id,
            group_id,
            sender_id: user_id,
            sender_name,
            client_message_id: Some(client_message_id.clone()),
            kind: draft.kind,
            body: draft.body.clone(),
            attachment: draft.attachment.clone(),
            reply_to: reply.map(|r| ReplySnapshot {
                message_id: r.message_id,
                sender_name: r.sender_name,
                preview: r.preview,
            }),
            edited: false,
            created_at,
        };

        let receivers = room.events.send(ServerEvent::MessageCreated {
            message: payload.clone(),
        });
        debug!(
            group_id = group_id.0,
            message_id = message_id.0,
            sessions = receivers.unwrap_or(0),
            "message accepted and fanned out"
        );
        Ok(payload)
    }

    /// Only the original sender may edit, only text messages, only while
    /// not soft-deleted.
    pub async fn edit(
        &self,
        user_id: UserId,
        message_id: MessageId,
        new_body: &str,
    ) -> Result<(), HubError> {
        if new_body.trim().is_empty() {
            return Err(HubError::Validation("edited body cannot be empty".into()));
        }
        let message = self.load_visible(message_id).await?;
        if message.sender_id != user_id {
            return Err(HubError::Forbidden(
                "only the original sender may edit a message".into(),
            ));
        }
        if message.kind != MessageKind::Text {
            return Err(HubError::Validation("only text messages can be edited".into()));
        }

        let room = self.room(message.group_id).await;
        let _write = room.write_guard.lock().await;
        let updated = self
            .storage
            .edit_message(message_id, new_body)
            .await
            .map_err(HubError::Internal)?;
        if !updated {
            return Err(HubError::NotFound(format!(
                "message {} not found",
                message_id.0
            )));
        }
        let _ = room.events.send(ServerEvent::MessageEdited {
            group_id: message.group_id,
            message_id,
            new_body: new_body.to_string(),
        });
        Ok(())
    }

    /// Marks a message soft-deleted and tells every session to drop it.
    /// Reply snapshots pointing at it keep rendering from their copy.
    pub async fn delete(&self, user_id: UserId, message_id: MessageId) -> Result<(), HubError> {
        let message = self.load_visible(message_id).await?;
        if message.sender_id != user_id {
            return Err(HubError::Forbidden(
                "only the original sender may delete a message".into(),
            ));
        }

        let room = self.room(message.group_id).await;
        let _write = room.write_guard.lock().await;
        let deleted = self
            .storage
            .soft_delete_message(message_id)
            .await
            .map_err(HubError::Internal)?;
        if deleted {
            let _ = room.events.send(ServerEvent::MessageDeleted {
                group_id: message.group_id,
                message_id,
            });
        }
        Ok(())
    }

    /// Advances the caller's read boundary to now. Fire-and-forget: no
    /// broadcast, and an out-of-date clock can never move it backwards.
    pub async fn mark_seen(&self, user_id: UserId, group_id: GroupId) -> Result<(), HubError> {
        self.ensure_member(group_id, user_id).await?;
        self.storage
            .mark_seen(user_id, group_id, Utc::now())
            .await
            .map_err(HubError::Internal)?;
        Ok(())
    }

    async fn load_visible(&self, message_id: MessageId) -> Result<StoredMessage, HubError> {
        let message = self
            .storage
            .find_message(message_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or_else(|| HubError::NotFound(format!("message {} not found", message_id.0)))?;
        if message.deleted {
            return Err(HubError::NotFound(format!(
                "message {} not found",
                message_id.0
            )));
        }
        Ok(message)
    }

    async fn snapshot_reply(
        &self,
        group_id: GroupId,
        target_id: MessageId,
    ) -> Result<StoredReply, HubError> {
        let target = self
            .storage
            .find_message(target_id)
            .await
            .map_err(HubError::Internal)?
            .ok_or_else(|| {
                HubError::Validation(format!("reply target {} does not exist", target_id.0))
            })?;
        if target.group_id != group_id || target.deleted {
            return Err(HubError::Validation(format!(
                "reply target {} is not visible in group {}",
                target_id.0, group_id.0
            )));
        }
        let sender_name = self
            .sender_name(target.sender_id)
            .await
            .unwrap_or_else(|| format!("user {}", target.sender_id.0));
        Ok(StoredReply {
            message_id: target.message_id,
            sender_name,
            preview: preview_of(&target),
        })
    }

    async fn sender_name(&self, user_id: UserId) -> Option<String> {
        match self.storage.user_profile(user_id).await {
            Ok(profile) => profile.map(|p| p.username),
            Err(err) => {
                warn!(user_id = user_id.0, %err, "failed to resolve sender name");
                None
            }
        }
    }
}

fn validate_draft(draft: &MessageDraft) -> Result<(), HubError> {
    if draft.kind.is_media() {
        if draft.body.is_some() {
            return Err(HubError::Validation(
                "media messages must not carry a body".into(),
            ));
        }
        if draft.attachment.is_none() {
            return Err(HubError::Validation(
                "media messages require an attachment reference".into(),
            ));
        }
    } else {
        if draft.attachment.is_some() {
            return Err(HubError::Validation(
                "text messages must not carry an attachment".into(),
            ));
        }
        match draft.body.as_deref() {
            Some(body) if !body.trim().is_empty() => {}
            _ => {
                return Err(HubError::Validation(
                    "text messages require a non-empty body".into(),
                ))
            }
        }
    }
    Ok(())
}

fn preview_of(message: &StoredMessage) -> String {
    let source = message
        .body
        .as_deref()
        .or(message.attachment.as_ref().map(|a| a.filename.as_str()))
        .unwrap_or_default();
    source.chars().take(REPLY_PREVIEW_MAX_CHARS).collect()
}

pub fn to_payload(message: StoredMessage, sender_name: Option<String>) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        group_id: message.group_id,
        sender_id: message.sender_id,
        sender_name,
        client_message_id: Some(message.client_message_id),
        kind: message.kind,
        body: message.body,
        attachment: message.attachment.map(|a| AttachmentRef {
            url: a.url,
            filename: a.filename,
        }),
        reply_to: message.reply.map(|r| ReplySnapshot {
            message_id: r.message_id,
            sender_name: r.sender_name,
            preview: r.preview,
        }),
        edited: message.edited,
        created_at: message.created_at,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
