use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use hub::Hub;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GroupId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientCommand, GroupOverview, GroupSummary, HistoryResponse, MessagePayload, ServerEvent,
    },
};
use storage::{GroupChanges, Storage, StoredGroup};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

mod auth;
mod config;

use auth::{Authenticator, TokenAuthenticator};
use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    storage: Storage,
    auth: Arc<dyn Authenticator>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    #[serde(default = "default_role")]
    role: Role,
    #[serde(default)]
    class_tag: Option<String>,
}

fn default_role() -> Role {
    Role::Student
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    theme_tag: Option<String>,
    #[serde(default)]
    member_role_tag: Option<String>,
    #[serde(default)]
    member_class_tag: Option<String>,
    #[serde(default)]
    member_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateGroupResponse {
    group_id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateGroupRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    theme_tag: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    member_role_tag: Option<String>,
    #[serde(default)]
    member_class_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let hub = Hub::new(storage.clone());
    let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(storage.clone()));

    let state = AppState { hub, storage, auth };
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/groups", get(http_list_groups).post(http_create_group))
        .route("/groups/:group_id", patch(http_update_group))
        .route("/groups/:group_id", delete(http_delete_group))
        .route("/groups/:group_id/members", post(http_add_member))
        .route(
            "/groups/:group_id/members/:user_id",
            delete(http_remove_member),
        )
        .route("/groups/:group_id/history", get(http_history))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn api_err(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(code, message)))
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    api_err(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Internal,
        err.to_string(),
    )
}

async fn bearer_user(state: &AppState, headers: &HeaderMap) -> ApiResult<UserId> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            api_err(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "missing bearer token",
            )
        })?;
    state
        .auth
        .identify(token)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            api_err(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "invalid bearer token",
            )
        })
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user_id = state
        .storage
        .create_user(&req.username, req.role, req.class_tag.as_deref())
        .await
        .map_err(|e| api_err(StatusCode::BAD_REQUEST, ErrorCode::Validation, e.to_string()))?;
    let token = state
        .storage
        .issue_auth_token(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

fn group_summary(group: &StoredGroup) -> GroupSummary {
    GroupSummary {
        group_id: group.group_id,
        name: group.name.clone(),
        theme_tag: group.theme_tag.clone(),
        avatar_url: group.avatar_url.clone(),
        creator_id: group.creator_user_id,
    }
}

async fn resolve_sender_names(
    state: &AppState,
    messages: Vec<storage::StoredMessage>,
) -> ApiResult<Vec<MessagePayload>> {
    let mut username_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let sender_name = if let Some(cached) = username_cache.get(&message.sender_id) {
            cached.clone()
        } else {
            let resolved = state
                .storage
                .user_profile(message.sender_id)
                .await
                .map_err(internal)?
                .map(|profile| profile.username);
            username_cache.insert(message.sender_id, resolved.clone());
            resolved
        };
        payloads.push(hub::to_payload(message, sender_name));
    }
    Ok(payloads)
}

async fn http_list_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<GroupOverview>>> {
    let user_id = bearer_user(&state, &headers).await?;
    let groups = state
        .storage
        .list_groups_for_user(user_id)
        .await
        .map_err(internal)?;

    let mut overviews = Vec::with_capacity(groups.len());
    for group in groups {
        let last = state
            .storage
            .last_message(group.group_id)
            .await
            .map_err(internal)?;
        let last_message = match last {
            Some(message) => resolve_sender_names(&state, vec![message]).await?.pop(),
            None => None,
        };
        let unread_count = state
            .storage
            .unread_count(user_id, group.group_id)
            .await
            .map_err(internal)?;
        overviews.push(GroupOverview {
            group: group_summary(&group),
            last_message,
            unread_count,
        });
    }
    Ok(Json(overviews))
}

async fn http_create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<Json<CreateGroupResponse>> {
    let user_id = bearer_user(&state, &headers).await?;
    let profile = state
        .storage
        .user_profile(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            api_err(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "unknown user",
            )
        })?;
    if !profile.role.can_create_groups() {
        return Err(api_err(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            "only staff accounts can create groups",
        ));
    }
    if req.name.trim().is_empty() {
        return Err(api_err(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "group name cannot be empty",
        ));
    }

    let group_id = state
        .storage
        .create_group(
            req.name.trim(),
            user_id,
            req.theme_tag.as_deref(),
            req.member_role_tag.as_deref(),
            req.member_class_tag.as_deref(),
        )
        .await
        .map_err(internal)?;
    for member in req.member_ids {
        state
            .storage
            .add_group_member(group_id, UserId(member))
            .await
            .map_err(internal)?;
    }
    info!(group_id = group_id.0, creator = user_id.0, "group created");
    Ok(Json(CreateGroupResponse {
        group_id: group_id.0,
    }))
}

async fn require_creator(
    state: &AppState,
    group_id: GroupId,
    user_id: UserId,
) -> ApiResult<StoredGroup> {
    let group = state
        .storage
        .group_meta(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            api_err(
                StatusCode::NOT_FOUND,
                ErrorCode::NotFound,
                "group not found",
            )
        })?;
    if group.creator_user_id != user_id {
        return Err(api_err(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            "only the group creator may modify it",
        ));
    }
    Ok(group)
}

async fn http_update_group(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateGroupRequest>,
) -> ApiResult<StatusCode> {
    let user_id = bearer_user(&state, &headers).await?;
    let group_id = GroupId(group_id);
    require_creator(&state, group_id, user_id).await?;

    state
        .storage
        .update_group(
            group_id,
            &GroupChanges {
                name: req.name,
                theme_tag: req.theme_tag,
                avatar_url: req.avatar_url,
                member_role_tag: req.member_role_tag,
                member_class_tag: req.member_class_tag,
            },
        )
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_group(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user_id = bearer_user(&state, &headers).await?;
    let group_id = GroupId(group_id);
    require_creator(&state, group_id, user_id).await?;

    state
        .storage
        .delete_group(group_id)
        .await
        .map_err(internal)?;
    info!(group_id = group_id.0, "group deleted with cascade");
    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_member(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<StatusCode> {
    let user_id = bearer_user(&state, &headers).await?;
    let group_id = GroupId(group_id);
    require_creator(&state, group_id, user_id).await?;

    state
        .storage
        .add_group_member(group_id, UserId(req.user_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_member(
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user_id = bearer_user(&state, &headers).await?;
    let group_id = GroupId(group_id);
    require_creator(&state, group_id, user_id).await?;

    let removed = state
        .storage
        .remove_group_member(group_id, UserId(member_id))
        .await
        .map_err(internal)?;
    if !removed {
        return Err(api_err(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            "user is not on the group roster",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_history(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<HistoryResponse>> {
    let user_id = bearer_user(&state, &headers).await?;
    let group_id = GroupId(group_id);
    let member = state
        .storage
        .is_member(group_id, user_id)
        .await
        .map_err(internal)?;
    if !member {
        return Err(api_err(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            "user is not a member of this group",
        ));
    }

    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let messages = state
        .storage
        .list_group_messages(group_id, limit, q.before)
        .await
        .map_err(internal)?;
    let messages = resolve_sender_names(&state, messages).await?;
    let read_state = state
        .storage
        .read_state(user_id, group_id)
        .await
        .map_err(internal)?;

    Ok(Json(HistoryResponse {
        messages,
        read_state,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> ApiResult<impl IntoResponse> {
    let user_id = state
        .auth
        .identify(&q.token)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            api_err(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "invalid bearer token",
            )
        })?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

/// Pumps one room subscription into the session's outbound queue. A
/// lagged receiver stays subscribed: the skipped events are reported to
/// the session as a transient delivery error so it can refetch history.
async fn forward_room_events(
    mut room_rx: broadcast::Receiver<ServerEvent>,
    forward_tx: mpsc::Sender<ServerEvent>,
) {
    loop {
        match room_rx.recv().await {
            Ok(event) => {
                if forward_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session lagged behind room broadcast");
                let notice = ServerEvent::Error(ApiError::new(
                    ErrorCode::TransientDelivery,
                    format!("{skipped} room events were dropped; refetch history"),
                ));
                if forward_tx.send(notice).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One session per device. Translates wire commands into hub operations
/// and forwards room events back; no business logic lives here. Dropping
/// the socket silently drops every room subscription.
async fn ws_connection(state: AppState, socket: axum::extract::ws::WebSocket, user_id: UserId) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(256);

    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut room_tasks: HashMap<GroupId, tokio::task::JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let command = match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => command,
            Err(err) => {
                let _ = out_tx
                    .send(ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        format!("invalid command: {err}"),
                    )))
                    .await;
                continue;
            }
        };

        match command {
            ClientCommand::Join { group_id } => match state.hub.join(user_id, group_id).await {
                Ok(room_rx) => {
                    let forward_tx = out_tx.clone();
                    let task = tokio::spawn(forward_room_events(room_rx, forward_tx));
                    if let Some(previous) = room_tasks.insert(group_id, task) {
                        previous.abort();
                    }
                    let _ = out_tx.send(ServerEvent::Joined { group_id }).await;
                }
                Err(err) => {
                    let _ = out_tx.send(ServerEvent::Error(ApiError::from(err))).await;
                }
            },
            ClientCommand::Send {
                group_id,
                client_message_id,
                draft,
            } => {
                match state
                    .hub
                    .send(user_id, group_id, &client_message_id, &draft)
                    .await
                {
                    Ok(message) => {
                        // Echo the acceptance to this session. A deduped
                        // resend produces no room broadcast, so this is the
                        // only confirmation the retrying client gets; the
                        // duplicate on the fresh-send path reconciles
                        // idempotently client-side.
                        let _ = out_tx.send(ServerEvent::MessageCreated { message }).await;
                    }
                    Err(err) => {
                        warn!(
                            group_id = group_id.0,
                            user_id = user_id.0,
                            %err,
                            "send rejected"
                        );
                        let _ = out_tx
                            .send(ServerEvent::SendRejected {
                                client_message_id,
                                error: ApiError::from(err),
                            })
                            .await;
                    }
                }
            }
            ClientCommand::Edit {
                message_id,
                new_body,
            } => {
                if let Err(err) = state.hub.edit(user_id, message_id, &new_body).await {
                    let _ = out_tx.send(ServerEvent::Error(ApiError::from(err))).await;
                }
            }
            ClientCommand::Delete { message_id } => {
                if let Err(err) = state.hub.delete(user_id, message_id).await {
                    let _ = out_tx.send(ServerEvent::Error(ApiError::from(err))).await;
                }
            }
            ClientCommand::MarkSeen { group_id } => {
                if let Err(err) = state.hub.mark_seen(user_id, group_id).await {
                    warn!(group_id = group_id.0, user_id = user_id.0, %err, "mark_seen failed");
                }
            }
        }
    }

    for task in room_tasks.values() {
        task.abort();
    }
    send_task.abort();
}
