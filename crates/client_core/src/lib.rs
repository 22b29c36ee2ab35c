//! Client-side core for the group chat service: HTTP session management,
//! the websocket event loop, and one [`ConversationView`] per joined group.
//! UI layers subscribe to [`ClientEvent`] and re-render the affected view.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ClientMessageId, GroupId, MessageId, MessageKind, Role, UserId},
    protocol::{
        ClientCommand, GroupOverview, HistoryResponse, MessageDraft, ServerEvent,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

pub mod conversation;
pub mod uploader;

pub use conversation::{ConversationEntry, ConversationView, PendingStatus};
pub use uploader::{AttachmentUploader, HttpAttachmentUploader};

/// How long a pending send may sit in `Sending` before the client gives up
/// and marks it failed locally. A late server echo after this still
/// reconciles through the client message id.
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// An entry list changed; re-render that conversation.
    ConversationUpdated { group_id: GroupId },
    /// A pending send moved to `Failed`. The entry stays visible until the
    /// user retries or discards it.
    SendFailed {
        group_id: GroupId,
        client_message_id: ClientMessageId,
        reason: String,
    },
    Joined { group_id: GroupId },
    Error(String),
}

#[derive(Serialize)]
struct LoginHttpRequest<'a> {
    username: &'a str,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    class_tag: Option<&'a str>,
}

#[derive(Deserialize)]
struct LoginHttpResponse {
    user_id: i64,
    token: String,
}

struct ClientState {
    server_url: Option<String>,
    token: Option<String>,
    user_id: Option<UserId>,
    outbound: Option<mpsc::Sender<Message>>,
}

pub struct ChatClient {
    http: Client,
    uploader: Arc<dyn AttachmentUploader>,
    inner: Mutex<ClientState>,
    views: Mutex<HashMap<GroupId, ConversationView>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(uploader: Arc<dyn AttachmentUploader>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            uploader,
            inner: Mutex::new(ClientState {
                server_url: None,
                token: None,
                user_id: None,
                outbound: None,
            }),
            views: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Exchanges a username for a bearer token and opens the websocket
    /// session. Must be called before any other operation.
    pub async fn login(
        self: &Arc<Self>,
        server_url: &str,
        username: &str,
        role: Role,
        class_tag: Option<&str>,
    ) -> Result<UserId> {
        let response: LoginHttpResponse = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginHttpRequest {
                username,
                role,
                class_tag,
            })
            .send()
            .await
            .context("login request failed")?
            .error_for_status()
            .context("login rejected")?
            .json()
            .await
            .context("invalid login response")?;

        let user_id = UserId(response.user_id);
        {
            let mut guard = self.inner.lock().await;
            guard.server_url = Some(server_url.to_owned());
            guard.token = Some(response.token.clone());
            guard.user_id = Some(user_id);
        }
        self.spawn_ws_events(server_url, &response.token).await?;
        info!(user_id = user_id.0, "logged in");
        Ok(user_id)
    }

    pub async fn fetch_groups(&self) -> Result<Vec<GroupOverview>> {
        let (server_url, token) = self.session().await?;
        let overviews = self
            .http
            .get(format!("{server_url}/groups"))
            .bearer_auth(&token)
            .send()
            .await
            .context("group list request failed")?
            .error_for_status()
            .context("group list rejected")?
            .json()
            .await
            .context("invalid group list response")?;
        Ok(overviews)
    }

    /// Fetches the history page, seeds a fresh [`ConversationView`] (the
    /// unread boundary is computed here, once), and joins the room over the
    /// websocket so live events start flowing.
    pub async fn open_conversation(self: &Arc<Self>, group_id: GroupId) -> Result<()> {
        let (server_url, token) = self.session().await?;
        let viewer = self
            .inner
            .lock()
            .await
            .user_id
            .ok_or_else(|| anyhow!("not logged in"))?;

        let history: HistoryResponse = self
            .http
            .get(format!("{server_url}/groups/{}/history", group_id.0))
            .bearer_auth(&token)
            .send()
            .await
            .context("history request failed")?
            .error_for_status()
            .context("history rejected")?
            .json()
            .await
            .context("invalid history response")?;

        let view = ConversationView::open(group_id, viewer, history);
        self.views.lock().await.insert(group_id, view);
        self.send_command(ClientCommand::Join { group_id }).await?;
        self.emit(ClientEvent::ConversationUpdated { group_id });
        Ok(())
    }

    pub async fn close_conversation(&self, group_id: GroupId) {
        self.views.lock().await.remove(&group_id);
    }

    /// Snapshot of a view's entries for rendering.
    pub async fn conversation_entries(&self, group_id: GroupId) -> Option<Vec<ConversationEntry>> {
        self.views
            .lock()
            .await
            .get(&group_id)
            .map(|view| view.entries().to_vec())
    }

    pub async fn unread_boundary(&self, group_id: GroupId) -> Option<MessageId> {
        self.views
            .lock()
            .await
            .get(&group_id)
            .and_then(|view| view.unread_boundary())
    }

    /// Optimistic text send: the entry appears immediately, the command goes
    /// on the wire, and a timer fails the entry if no echo arrives.
    pub async fn send_text(
        self: &Arc<Self>,
        group_id: GroupId,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<ClientMessageId> {
        let mut draft = MessageDraft::text(body);
        if let Some(target) = reply_to {
            draft = draft.replying_to(target);
        }

        let client_message_id = {
            let mut views = self.views.lock().await;
            let view = views
                .get_mut(&group_id)
                .ok_or_else(|| anyhow!("conversation {} is not open", group_id.0))?;
            view.begin_send(draft.clone())
        };
        self.emit(ClientEvent::ConversationUpdated { group_id });

        if let Err(err) = self
            .send_command(ClientCommand::Send {
                group_id,
                client_message_id: client_message_id.clone(),
                draft,
            })
            .await
        {
            self.fail_pending(group_id, &client_message_id, err.to_string())
                .await;
            return Err(err);
        }
        self.arm_ack_timeout(group_id, client_message_id.clone());
        Ok(client_message_id)
    }

    /// Optimistic media send: the entry shows upload progress while the
    /// bytes move, then flips to `Sending` once the attachment reference is
    /// known and the command is on the wire.
    pub async fn send_media(
        self: &Arc<Self>,
        group_id: GroupId,
        kind: MessageKind,
        bytes: Vec<u8>,
        filename: String,
        reply_to: Option<MessageId>,
    ) -> Result<ClientMessageId> {
        if !kind.is_media() {
            return Err(anyhow!("send_media requires a media kind"));
        }
        let mut draft = MessageDraft {
            kind,
            body: None,
            attachment: None,
            reply_to: None,
        };
        if let Some(target) = reply_to {
            draft = draft.replying_to(target);
        }

        let client_message_id = {
            let mut views = self.views.lock().await;
            let view = views
                .get_mut(&group_id)
                .ok_or_else(|| anyhow!("conversation {} is not open", group_id.0))?;
            view.begin_media_send(draft)
        };
        self.emit(ClientEvent::ConversationUpdated { group_id });

        let client = Arc::clone(self);
        let upload_id = client_message_id.clone();
        tokio::spawn(async move {
            client.run_upload(group_id, upload_id, bytes, filename).await;
        });
        Ok(client_message_id)
    }

    async fn run_upload(
        self: Arc<Self>,
        group_id: GroupId,
        client_message_id: ClientMessageId,
        bytes: Vec<u8>,
        filename: String,
    ) {
        let (progress_tx, mut progress_rx) = mpsc::channel::<u8>(16);
        let progress_client = Arc::clone(&self);
        let progress_id = client_message_id.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(percent) = progress_rx.recv().await {
                let mut views = progress_client.views.lock().await;
                if let Some(view) = views.get_mut(&group_id) {
                    view.set_upload_progress(&progress_id, percent);
                }
                drop(views);
                progress_client.emit(ClientEvent::ConversationUpdated { group_id });
            }
        });

        let outcome = self
            .uploader
            .upload(bytes, &filename, progress_tx)
            .await;
        let _ = progress_task.await;

        match outcome {
            Ok(attachment) => {
                let draft = {
                    let mut views = self.views.lock().await;
                    views
                        .get_mut(&group_id)
                        .and_then(|view| view.attachment_ready(&client_message_id, attachment))
                };
                // None: cancelled while uploading, nothing left to send.
                let Some(draft) = draft else { return };
                self.emit(ClientEvent::ConversationUpdated { group_id });
                if let Err(err) = self
                    .send_command(ClientCommand::Send {
                        group_id,
                        client_message_id: client_message_id.clone(),
                        draft,
                    })
                    .await
                {
                    self.fail_pending(group_id, &client_message_id, err.to_string())
                        .await;
                    return;
                }
                self.arm_ack_timeout(group_id, client_message_id);
            }
            Err(err) => {
                warn!(group_id = group_id.0, %err, "attachment upload failed");
                self.fail_pending(group_id, &client_message_id, err.to_string())
                    .await;
            }
        }
    }

    /// Re-sends a failed entry under its original client message id.
    pub async fn retry_send(
        self: &Arc<Self>,
        group_id: GroupId,
        client_message_id: &ClientMessageId,
    ) -> Result<()> {
        let draft = {
            let mut views = self.views.lock().await;
            views
                .get_mut(&group_id)
                .and_then(|view| view.retry(client_message_id))
        }
        .ok_or_else(|| anyhow!("no failed entry to retry"))?;
        self.emit(ClientEvent::ConversationUpdated { group_id });

        if let Err(err) = self
            .send_command(ClientCommand::Send {
                group_id,
                client_message_id: client_message_id.clone(),
                draft,
            })
            .await
        {
            self.fail_pending(group_id, client_message_id, err.to_string())
                .await;
            return Err(err);
        }
        self.arm_ack_timeout(group_id, client_message_id.clone());
        Ok(())
    }

    pub async fn discard_failed(&self, group_id: GroupId, client_message_id: &ClientMessageId) {
        let removed = {
            let mut views = self.views.lock().await;
            views
                .get_mut(&group_id)
                .map_or(false, |view| view.discard_failed(client_message_id))
        };
        if removed {
            self.emit(ClientEvent::ConversationUpdated { group_id });
        }
    }

    pub async fn cancel_upload(&self, group_id: GroupId, client_message_id: &ClientMessageId) {
        let removed = {
            let mut views = self.views.lock().await;
            views
                .get_mut(&group_id)
                .map_or(false, |view| view.cancel_upload(client_message_id))
        };
        if removed {
            self.emit(ClientEvent::ConversationUpdated { group_id });
        }
    }

    pub async fn edit_message(&self, message_id: MessageId, new_body: &str) -> Result<()> {
        self.send_command(ClientCommand::Edit {
            message_id,
            new_body: new_body.to_owned(),
        })
        .await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.send_command(ClientCommand::Delete { message_id })
            .await
    }

    /// Tells the server the viewer has caught up. The local unread boundary
    /// is left alone; it only moves when the conversation is reopened.
    pub async fn mark_seen(&self, group_id: GroupId) -> Result<()> {
        self.send_command(ClientCommand::MarkSeen { group_id }).await
    }

    async fn session(&self) -> Result<(String, String)> {
        let guard = self.inner.lock().await;
        match (&guard.server_url, &guard.token) {
            (Some(url), Some(token)) => Ok((url.clone(), token.clone())),
            _ => Err(anyhow!("not logged in")),
        }
    }

    async fn send_command(&self, command: ClientCommand) -> Result<()> {
        let outbound = {
            let guard = self.inner.lock().await;
            guard
                .outbound
                .clone()
                .ok_or_else(|| anyhow!("websocket session is not connected"))?
        };
        let text = serde_json::to_string(&command)?;
        outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| anyhow!("websocket session closed"))
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn arm_ack_timeout(self: &Arc<Self>, group_id: GroupId, client_message_id: ClientMessageId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SEND_ACK_TIMEOUT).await;
            let still_sending = {
                let views = client.views.lock().await;
                views
                    .get(&group_id)
                    .and_then(|view| view.pending_status(&client_message_id))
                    == Some(&PendingStatus::Sending)
            };
            if still_sending {
                client
                    .fail_pending(
                        group_id,
                        &client_message_id,
                        "no acknowledgement from server",
                    )
                    .await;
            }
        });
    }

    async fn fail_pending(
        &self,
        group_id: GroupId,
        client_message_id: &ClientMessageId,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        {
            let mut views = self.views.lock().await;
            if let Some(view) = views.get_mut(&group_id) {
                view.mark_failed(client_message_id, reason.clone());
            }
        }
        self.emit(ClientEvent::ConversationUpdated { group_id });
        self.emit(ClientEvent::SendFailed {
            group_id,
            client_message_id: client_message_id.clone(),
            reason,
        });
    }

    async fn spawn_ws_events(self: &Arc<Self>, server_url: &str, token: &str) -> Result<()> {
        let ws_url = ws_url(server_url, token)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
        self.inner.lock().await.outbound = Some(outbound_tx);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => {
                            client.emit(ClientEvent::Error(format!("invalid server event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        client.emit(ClientEvent::Error(format!("websocket receive failed: {err}")));
                        break;
                    }
                }
            }
            client.inner.lock().await.outbound = None;
        });
        Ok(())
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated { message } => {
                let group_id = message.group_id;
                let mut views = self.views.lock().await;
                if let Some(view) = views.get_mut(&group_id) {
                    view.apply_created(message);
                    drop(views);
                    self.emit(ClientEvent::ConversationUpdated { group_id });
                }
            }
            ServerEvent::MessageEdited {
                group_id,
                message_id,
                new_body,
            } => {
                let mut views = self.views.lock().await;
                if let Some(view) = views.get_mut(&group_id) {
                    view.apply_edited(message_id, &new_body);
                    drop(views);
                    self.emit(ClientEvent::ConversationUpdated { group_id });
                }
            }
            ServerEvent::MessageDeleted {
                group_id,
                message_id,
            } => {
                let mut views = self.views.lock().await;
                if let Some(view) = views.get_mut(&group_id) {
                    view.apply_deleted(message_id);
                    drop(views);
                    self.emit(ClientEvent::ConversationUpdated { group_id });
                }
            }
            ServerEvent::Joined { group_id } => {
                self.emit(ClientEvent::Joined { group_id });
            }
            ServerEvent::SendRejected {
                client_message_id,
                error,
            } => {
                // The rejection carries no group id; find the view holding
                // the pending entry.
                let group_id = {
                    let views = self.views.lock().await;
                    views
                        .iter()
                        .find(|(_, view)| view.pending_status(&client_message_id).is_some())
                        .map(|(group_id, _)| *group_id)
                };
                match group_id {
                    Some(group_id) => {
                        self.fail_pending(group_id, &client_message_id, error.message)
                            .await;
                    }
                    None => {
                        self.emit(ClientEvent::Error(format!(
                            "send rejected: {}",
                            error.message
                        )));
                    }
                }
            }
            ServerEvent::Error(error) => {
                self.emit(ClientEvent::Error(error.message));
            }
        }
    }
}

fn ws_url(server_url: &str, token: &str) -> Result<String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/ws?token={token}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
