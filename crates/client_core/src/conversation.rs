//! In-memory model of one open conversation. Synchronous on purpose: the
//! client task owns a view per joined group and feeds it history pages,
//! local sends, and server events; rendering reads the entry list as-is.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, GroupId, MessageId, UserId},
    protocol::{HistoryResponse, MessageDraft, MessagePayload},
};

/// Delivery state of a locally originated entry that the server has not
/// confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    /// Attachment bytes are still being pushed to the upload service.
    Uploading { percent: u8 },
    /// The send command is on the wire, waiting for the broadcast echo.
    Sending,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub enum ConversationEntry {
    Confirmed(MessagePayload),
    Pending {
        client_message_id: ClientMessageId,
        draft: MessageDraft,
        status: PendingStatus,
        queued_at: DateTime<Utc>,
    },
}

impl ConversationEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, ConversationEntry::Pending { .. })
    }

    pub fn message(&self) -> Option<&MessagePayload> {
        match self {
            ConversationEntry::Confirmed(message) => Some(message),
            ConversationEntry::Pending { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Pending(ClientMessageId),
    Confirmed(MessageId),
}

/// Ordered timeline for one group: confirmed messages in acceptance order,
/// then this device's unconfirmed sends at the tail. A confirmed broadcast
/// carrying a known `client_message_id` replaces the pending entry in place
/// rather than appending a duplicate.
pub struct ConversationView {
    group_id: GroupId,
    viewer: UserId,
    entries: Vec<ConversationEntry>,
    index: HashMap<EntryKey, usize>,
    unread_boundary: Option<MessageId>,
}

impl ConversationView {
    /// Seeds the view from a fetched history page and computes the unread
    /// boundary once. The boundary does not move while the view is open;
    /// reopening recomputes it from the then-current read state.
    pub fn open(group_id: GroupId, viewer: UserId, history: HistoryResponse) -> Self {
        let unread_boundary = history
            .messages
            .iter()
            .find(|message| {
                message.sender_id != viewer
                    && history
                        .read_state
                        .map_or(true, |seen| message.created_at > seen)
            })
            .map(|message| message.message_id);

        let mut view = Self {
            group_id,
            viewer,
            entries: Vec::with_capacity(history.messages.len()),
            index: HashMap::new(),
            unread_boundary,
        };
        for message in history.messages {
            view.push_confirmed(message);
        }
        view
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    /// First confirmed message the viewer had not seen when the view was
    /// opened, if any. Rendered as the "new messages" divider.
    pub fn unread_boundary(&self) -> Option<MessageId> {
        self.unread_boundary
    }

    pub fn pending_status(&self, client_message_id: &ClientMessageId) -> Option<&PendingStatus> {
        let position = *self
            .index
            .get(&EntryKey::Pending(client_message_id.clone()))?;
        match &self.entries[position] {
            ConversationEntry::Pending { status, .. } => Some(status),
            ConversationEntry::Confirmed(_) => None,
        }
    }

    /// Appends a locally originated text send. The entry renders immediately
    /// and stays at the tail until the server echoes it back.
    pub fn begin_send(&mut self, draft: MessageDraft) -> ClientMessageId {
        self.push_pending(draft, PendingStatus::Sending)
    }

    /// Appends a media send that still has its attachment in flight. The
    /// entry moves to `Sending` once `attachment_ready` is called.
    pub fn begin_media_send(&mut self, draft: MessageDraft) -> ClientMessageId {
        self.push_pending(draft, PendingStatus::Uploading { percent: 0 })
    }

    pub fn set_upload_progress(&mut self, client_message_id: &ClientMessageId, percent: u8) {
        if let Some(ConversationEntry::Pending { status, .. }) =
            self.pending_entry_mut(client_message_id)
        {
            if matches!(status, PendingStatus::Uploading { .. }) {
                *status = PendingStatus::Uploading {
                    percent: percent.min(100),
                };
            }
        }
    }

    /// Attaches the uploaded reference to a pending media entry and flips it
    /// to `Sending`. Returns the completed draft so the caller can put the
    /// send command on the wire.
    pub fn attachment_ready(
        &mut self,
        client_message_id: &ClientMessageId,
        attachment: shared::protocol::AttachmentRef,
    ) -> Option<MessageDraft> {
        match self.pending_entry_mut(client_message_id) {
            Some(ConversationEntry::Pending { draft, status, .. }) => {
                draft.attachment = Some(attachment);
                *status = PendingStatus::Sending;
                Some(draft.clone())
            }
            _ => None,
        }
    }

    /// Drops an entry whose upload the user abandoned. Only meaningful while
    /// the attachment is still in flight.
    pub fn cancel_upload(&mut self, client_message_id: &ClientMessageId) -> bool {
        let uploading = matches!(
            self.pending_status(client_message_id),
            Some(PendingStatus::Uploading { .. })
        );
        if uploading {
            self.remove_pending(client_message_id)
        } else {
            false
        }
    }

    pub fn mark_failed(&mut self, client_message_id: &ClientMessageId, reason: impl Into<String>) {
        if let Some(ConversationEntry::Pending { status, .. }) =
            self.pending_entry_mut(client_message_id)
        {
            *status = PendingStatus::Failed {
                reason: reason.into(),
            };
        }
    }

    /// Re-arms a failed entry for another send attempt under the SAME
    /// client message id, so a late echo of the first attempt still
    /// reconciles instead of duplicating.
    pub fn retry(&mut self, client_message_id: &ClientMessageId) -> Option<MessageDraft> {
        match self.pending_entry_mut(client_message_id) {
            Some(ConversationEntry::Pending { draft, status, .. })
                if matches!(status, PendingStatus::Failed { .. }) =>
            {
                *status = PendingStatus::Sending;
                Some(draft.clone())
            }
            _ => None,
        }
    }

    pub fn discard_failed(&mut self, client_message_id: &ClientMessageId) -> bool {
        let failed = matches!(
            self.pending_status(client_message_id),
            Some(PendingStatus::Failed { .. })
        );
        if failed {
            self.remove_pending(client_message_id)
        } else {
            false
        }
    }

    /// Folds a `message_created` broadcast into the timeline. Replaces the
    /// matching pending entry in place when the echo carries our client
    /// message id; otherwise inserts in timestamp order ahead of any pending
    /// tail. Re-delivery of an already confirmed id is a no-op.
    pub fn apply_created(&mut self, message: MessagePayload) {
        if self
            .index
            .contains_key(&EntryKey::Confirmed(message.message_id))
        {
            return;
        }

        if message.sender_id == self.viewer {
            if let Some(client_message_id) = message.client_message_id.clone() {
                let key = EntryKey::Pending(client_message_id);
                if let Some(position) = self.index.remove(&key) {
                    self.index
                        .insert(EntryKey::Confirmed(message.message_id), position);
                    self.entries[position] = ConversationEntry::Confirmed(message);
                    return;
                }
            }
        }

        let position = self.insertion_point(message.created_at);
        self.entries
            .insert(position, ConversationEntry::Confirmed(message));
        self.reindex_from(position);
    }

    pub fn apply_edited(&mut self, message_id: MessageId, new_body: &str) {
        if let Some(&position) = self.index.get(&EntryKey::Confirmed(message_id)) {
            if let ConversationEntry::Confirmed(message) = &mut self.entries[position] {
                message.body = Some(new_body.to_owned());
                message.edited = true;
            }
        }
    }

    pub fn apply_deleted(&mut self, message_id: MessageId) {
        if let Some(position) = self.index.remove(&EntryKey::Confirmed(message_id)) {
            self.entries.remove(position);
            self.reindex_from(position);
        }
        if self.unread_boundary == Some(message_id) {
            self.unread_boundary = None;
        }
    }

    fn push_confirmed(&mut self, message: MessagePayload) {
        let position = self.entries.len();
        self.index
            .insert(EntryKey::Confirmed(message.message_id), position);
        self.entries.push(ConversationEntry::Confirmed(message));
    }

    fn push_pending(&mut self, draft: MessageDraft, status: PendingStatus) -> ClientMessageId {
        let client_message_id = ClientMessageId::generate();
        let position = self.entries.len();
        self.index
            .insert(EntryKey::Pending(client_message_id.clone()), position);
        self.entries.push(ConversationEntry::Pending {
            client_message_id: client_message_id.clone(),
            draft,
            status,
            queued_at: Utc::now(),
        });
        client_message_id
    }

    fn pending_entry_mut(
        &mut self,
        client_message_id: &ClientMessageId,
    ) -> Option<&mut ConversationEntry> {
        let position = *self
            .index
            .get(&EntryKey::Pending(client_message_id.clone()))?;
        self.entries.get_mut(position)
    }

    fn remove_pending(&mut self, client_message_id: &ClientMessageId) -> bool {
        match self
            .index
            .remove(&EntryKey::Pending(client_message_id.clone()))
        {
            Some(position) => {
                self.entries.remove(position);
                self.reindex_from(position);
                true
            }
            None => false,
        }
    }

    /// Position for a confirmed arrival: walk back from the tail past the
    /// pending block, then past any confirmed message with a later
    /// timestamp. Confirmed order therefore tracks server acceptance order
    /// even when broadcasts race history fetches.
    fn insertion_point(&self, created_at: DateTime<Utc>) -> usize {
        let mut position = self.entries.len();
        while position > 0 {
            match &self.entries[position - 1] {
                ConversationEntry::Pending { .. } => position -= 1,
                ConversationEntry::Confirmed(existing) => {
                    if existing.created_at > created_at {
                        position -= 1;
                    } else {
                        break;
                    }
                }
            }
        }
        position
    }

    fn reindex_from(&mut self, start: usize) {
        for position in start..self.entries.len() {
            let key = match &self.entries[position] {
                ConversationEntry::Confirmed(message) => EntryKey::Confirmed(message.message_id),
                ConversationEntry::Pending {
                    client_message_id, ..
                } => EntryKey::Pending(client_message_id.clone()),
            };
            self.index.insert(key, position);
        }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
