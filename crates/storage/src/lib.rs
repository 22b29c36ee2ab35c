use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ClientMessageId, GroupId, MessageId, MessageKind, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub class_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub group_id: GroupId,
    pub name: String,
    pub theme_tag: Option<String>,
    pub avatar_url: Option<String>,
    pub creator_user_id: UserId,
    pub member_role_tag: Option<String>,
    pub member_class_tag: Option<String>,
}

/// Partial update applied by the group's creator. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    pub name: Option<String>,
    pub theme_tag: Option<String>,
    pub avatar_url: Option<String>,
    pub member_role_tag: Option<String>,
    pub member_class_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReply {
    pub message_id: MessageId,
    pub sender_name: String,
    pub preview: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub client_message_id: ClientMessageId,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub attachment: Option<StoredAttachment>,
    pub reply: Option<StoredReply>,
    pub edited: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Sender-supplied message fields plus the hub-captured reply snapshot.
/// The hub assigns `created_at`; the store assigns the identifier.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub client_message_id: &'a ClientMessageId,
    pub kind: MessageKind,
    pub body: Option<&'a str>,
    pub attachment: Option<&'a StoredAttachment>,
    pub reply: Option<&'a StoredReply>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        role: Role,
        class_tag: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, role, class_tag) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET role=excluded.role, class_tag=excluded.class_tag
             RETURNING id",
        )
        .bind(username)
        .bind(role.as_str())
        .bind(class_tag)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, role, class_tag FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            role: role_from_str(&r.get::<String, _>(2)),
            class_tag: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn issue_auth_token(&self, user_id: UserId) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO auth_tokens (token, user_id) VALUES (?, ?)")
            .bind(&token)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn resolve_auth_token(&self, token: &str) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT user_id FROM auth_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn create_group(
        &self,
        name: &str,
        creator_user_id: UserId,
        theme_tag: Option<&str>,
        member_role_tag: Option<&str>,
        member_class_tag: Option<&str>,
    ) -> Result<GroupId> {
        let rec = sqlx::query(
            "INSERT INTO chat_groups (name, theme_tag, creator_user_id, member_role_tag, member_class_tag)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(name)
        .bind(theme_tag)
        .bind(creator_user_id.0)
        .bind(member_role_tag)
        .bind(member_class_tag)
        .fetch_one(&self.pool)
        .await?;
        let group_id = GroupId(rec.get::<i64, _>(0));
        self.add_group_member(group_id, creator_user_id).await?;
        Ok(group_id)
    }

    pub async fn update_group(&self, group_id: GroupId, changes: &GroupChanges) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE chat_groups SET
                name = COALESCE(?, name),
                theme_tag = COALESCE(?, theme_tag),
                avatar_url = COALESCE(?, avatar_url),
                member_role_tag = COALESCE(?, member_role_tag),
                member_class_tag = COALESCE(?, member_class_tag)
             WHERE id = ?",
        )
        .bind(changes.name.as_deref())
        .bind(changes.theme_tag.as_deref())
        .bind(changes.avatar_url.as_deref())
        .bind(changes.member_role_tag.as_deref())
        .bind(changes.member_class_tag.as_deref())
        .bind(group_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Deletes a group and cascades its messages, roster and read state in
    /// one transaction.
    pub async fn delete_group(&self, group_id: GroupId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE group_id = ?")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = ?")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM read_states WHERE group_id = ?")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chat_groups WHERE id = ?")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES (?, ?)
             ON CONFLICT(group_id, user_id) DO NOTHING",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn group_meta(&self, group_id: GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query(
            "SELECT id, name, theme_tag, avatar_url, creator_user_id, member_role_tag, member_class_tag
             FROM chat_groups WHERE id = ?",
        )
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(group_from_row))
    }

    /// Membership criteria: the explicit roster, or a role/class tag match
    /// against the user's profile.
    pub async fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2
             ) OR EXISTS (
                SELECT 1 FROM chat_groups g, users u
                WHERE g.id = ?1 AND u.id = ?2
                  AND ((g.member_role_tag IS NOT NULL AND g.member_role_tag = u.role)
                    OR (g.member_class_tag IS NOT NULL AND g.member_class_tag = u.class_tag))
             )",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>(0))
    }

    pub async fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<StoredGroup>> {
        let rows = sqlx::query(
            "SELECT DISTINCT g.id, g.name, g.theme_tag, g.avatar_url, g.creator_user_id,
                    g.member_role_tag, g.member_class_tag
             FROM chat_groups g
             LEFT JOIN group_members m ON m.group_id = g.id AND m.user_id = ?1
             LEFT JOIN users u ON u.id = ?1
             WHERE m.user_id IS NOT NULL
                OR (g.member_role_tag IS NOT NULL AND g.member_role_tag = u.role)
                OR (g.member_class_tag IS NOT NULL AND g.member_class_tag = u.class_tag)
             ORDER BY g.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(group_from_row).collect())
    }

    pub async fn insert_message(&self, message: NewMessage<'_>) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (
                group_id, sender_user_id, client_message_id, kind, body,
                attachment_url, attachment_filename,
                reply_to_message_id, reply_to_sender, reply_to_preview,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.group_id.0)
        .bind(message.sender_id.0)
        .bind(message.client_message_id.as_str())
        .bind(message.kind.as_str())
        .bind(message.body)
        .bind(message.attachment.map(|a| a.url.as_str()))
        .bind(message.attachment.map(|a| a.filename.as_str()))
        .bind(message.reply.map(|r| r.message_id.0))
        .bind(message.reply.map(|r| r.sender_name.as_str()))
        .bind(message.reply.map(|r| r.preview.as_str()))
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn find_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(message_from_row))
    }

    /// Dedupe lookup for resends: scoped to `(group, sender)` since the
    /// correlation token is only unique per sender.
    pub async fn find_message_by_client_id(
        &self,
        group_id: GroupId,
        sender_id: UserId,
        client_message_id: &ClientMessageId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE group_id = ? AND sender_user_id = ? AND client_message_id = ?"
        ))
        .bind(group_id.0)
        .bind(sender_id.0)
        .bind(client_message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(message_from_row))
    }

    pub async fn edit_message(&self, message_id: MessageId, new_body: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET body = ?, edited = 1 WHERE id = ? AND deleted = 0",
        )
        .bind(new_body)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn soft_delete_message(&self, message_id: MessageId) -> Result<bool> {
        let updated = sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Newest page selected by id cursor, returned ascending. Soft-deleted
    /// messages are excluded.
    pub async fn list_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE group_id = ? AND deleted = 0 AND id < ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(group_id.0)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE group_id = ? AND deleted = 0
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(group_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    pub async fn last_message(&self, group_id: GroupId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE group_id = ? AND deleted = 0
             ORDER BY id DESC
             LIMIT 1"
        ))
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(message_from_row))
    }

    pub async fn read_state(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_seen_at FROM read_states WHERE user_id = ? AND group_id = ?",
        )
        .bind(user_id.0)
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
    }

    /// Advances the read boundary. Monotonic: an earlier timestamp than the
    /// stored one is a no-op. Returns whether the boundary moved.
    pub async fn mark_seen(
        &self,
        user_id: UserId,
        group_id: GroupId,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "INSERT INTO read_states (user_id, group_id, last_seen_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id, group_id) DO UPDATE SET last_seen_at = excluded.last_seen_at
             WHERE excluded.last_seen_at > read_states.last_seen_at",
        )
        .bind(user_id.0)
        .bind(group_id.0)
        .bind(seen_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Messages the viewer has not seen: newer than their read state and
    /// authored by someone else.
    pub async fn unread_count(&self, user_id: UserId, group_id: GroupId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.group_id = ?2 AND m.deleted = 0 AND m.sender_user_id != ?1
               AND m.created_at > COALESCE(
                    (SELECT last_seen_at FROM read_states WHERE user_id = ?1 AND group_id = ?2),
                    '')",
        )
        .bind(user_id.0)
        .bind(group_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

const MESSAGE_COLUMNS: &str = "id, group_id, sender_user_id, client_message_id, kind, body, \
     attachment_url, attachment_filename, reply_to_message_id, reply_to_sender, \
     reply_to_preview, edited, deleted, created_at";

fn message_from_row(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        group_id: GroupId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        client_message_id: ClientMessageId(r.get::<String, _>(3)),
        kind: kind_from_str(&r.get::<String, _>(4)),
        body: r.get::<Option<String>, _>(5),
        attachment: r.get::<Option<String>, _>(6).map(|url| StoredAttachment {
            url,
            filename: r
                .get::<Option<String>, _>(7)
                .unwrap_or_else(|| "attachment.bin".to_string()),
        }),
        reply: r.get::<Option<i64>, _>(8).map(|id| StoredReply {
            message_id: MessageId(id),
            sender_name: r.get::<Option<String>, _>(9).unwrap_or_default(),
            preview: r.get::<Option<String>, _>(10).unwrap_or_default(),
        }),
        edited: r.get::<bool, _>(11),
        deleted: r.get::<bool, _>(12),
        created_at: r.get::<DateTime<Utc>, _>(13),
    }
}

fn group_from_row(r: sqlx::sqlite::SqliteRow) -> StoredGroup {
    StoredGroup {
        group_id: GroupId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        theme_tag: r.get::<Option<String>, _>(2),
        avatar_url: r.get::<Option<String>, _>(3),
        creator_user_id: UserId(r.get::<i64, _>(4)),
        member_role_tag: r.get::<Option<String>, _>(5),
        member_class_tag: r.get::<Option<String>, _>(6),
    }
}

fn kind_from_str(raw: &str) -> MessageKind {
    match raw {
        "image" => MessageKind::Image,
        "video" => MessageKind::Video,
        "file" => MessageKind::File,
        _ => MessageKind::Text,
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "admin" => Role::Admin,
        "teacher" => Role::Teacher,
        _ => Role::Student,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
