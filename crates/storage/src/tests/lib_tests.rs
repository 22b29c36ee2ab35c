use super::*;
use chrono::Duration;

async fn mem() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

async fn seed_group(storage: &Storage) -> (UserId, GroupId) {
    let teacher = storage
        .create_user("ms-frizzle", Role::Teacher, None)
        .await
        .expect("user");
    let group = storage
        .create_group("science-3b", teacher, Some("green"), None, None)
        .await
        .expect("group");
    (teacher, group)
}

fn text_message<'a>(
    group_id: GroupId,
    sender_id: UserId,
    client_message_id: &'a ClientMessageId,
    body: &'a str,
    created_at: DateTime<Utc>,
) -> NewMessage<'a> {
    NewMessage {
        group_id,
        sender_id,
        client_message_id,
        kind: MessageKind::Text,
        body: Some(body),
        attachment: None,
        reply: None,
        created_at,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = mem().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("groupchat_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn auth_token_round_trips_to_user() {
    let storage = mem().await;
    let user = storage
        .create_user("alice", Role::Student, Some("3b"))
        .await
        .expect("user");
    let token = storage.issue_auth_token(user).await.expect("token");
    let resolved = storage.resolve_auth_token(&token).await.expect("resolve");
    assert_eq!(resolved, Some(user));
    assert_eq!(
        storage.resolve_auth_token("bogus").await.expect("resolve"),
        None
    );
}

#[tokio::test]
async fn text_message_round_trips_with_null_attachment() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let cmid = ClientMessageId::generate();
    let id = storage
        .insert_message(text_message(group, teacher, &cmid, "Hello", Utc::now()))
        .await
        .expect("insert");

    let stored = storage
        .find_message(id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(stored.kind, MessageKind::Text);
    assert_eq!(stored.body.as_deref(), Some("Hello"));
    assert!(stored.attachment.is_none());
    assert!(!stored.edited);
    assert!(!stored.deleted);
}

#[tokio::test]
async fn file_message_round_trips_with_null_body() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let cmid = ClientMessageId::generate();
    let attachment = StoredAttachment {
        url: "https://files.example/X".to_string(),
        filename: "worksheet.pdf".to_string(),
    };
    let id = storage
        .insert_message(NewMessage {
            group_id: group,
            sender_id: teacher,
            client_message_id: &cmid,
            kind: MessageKind::File,
            body: None,
            attachment: Some(&attachment),
            reply: None,
            created_at: Utc::now(),
        })
        .await
        .expect("insert");

    let stored = storage
        .find_message(id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(stored.kind, MessageKind::File);
    assert!(stored.body.is_none());
    assert_eq!(stored.attachment, Some(attachment));
}

#[tokio::test]
async fn client_message_id_lookup_is_scoped_to_sender_and_group() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;
    let student = storage
        .create_user("bob", Role::Student, Some("3b"))
        .await
        .expect("user");
    storage
        .add_group_member(group, student)
        .await
        .expect("member");

    let cmid = ClientMessageId("shared-token".to_string());
    let first = storage
        .insert_message(text_message(group, teacher, &cmid, "mine", Utc::now()))
        .await
        .expect("insert");

    let found = storage
        .find_message_by_client_id(group, teacher, &cmid)
        .await
        .expect("lookup");
    assert_eq!(found.map(|m| m.message_id), Some(first));

    let other_sender = storage
        .find_message_by_client_id(group, student, &cmid)
        .await
        .expect("lookup");
    assert!(other_sender.is_none());
}

#[tokio::test]
async fn paginates_group_messages_excluding_deleted() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let base = Utc::now();
    let mut ids = Vec::new();
    for i in 0..3 {
        let cmid = ClientMessageId::generate();
        let id = storage
            .insert_message(text_message(
                group,
                teacher,
                &cmid,
                &format!("m{i}"),
                base + Duration::milliseconds(i),
            ))
            .await
            .expect("insert");
        ids.push(id);
    }
    storage
        .soft_delete_message(ids[1])
        .await
        .expect("soft delete");

    let page = storage
        .list_group_messages(group, 10, None)
        .await
        .expect("page");
    let got: Vec<MessageId> = page.iter().map(|m| m.message_id).collect();
    assert_eq!(got, vec![ids[0], ids[2]]);

    let older = storage
        .list_group_messages(group, 10, Some(ids[2].0))
        .await
        .expect("older page");
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].message_id, ids[0]);
}

#[tokio::test]
async fn edit_sets_flag_and_skips_deleted_messages() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let cmid = ClientMessageId::generate();
    let id = storage
        .insert_message(text_message(group, teacher, &cmid, "tpyo", Utc::now()))
        .await
        .expect("insert");

    assert!(storage.edit_message(id, "typo").await.expect("edit"));
    let stored = storage
        .find_message(id)
        .await
        .expect("find")
        .expect("exists");
    assert!(stored.edited);
    assert_eq!(stored.body.as_deref(), Some("typo"));

    storage.soft_delete_message(id).await.expect("delete");
    assert!(!storage.edit_message(id, "nope").await.expect("edit"));
}

#[tokio::test]
async fn reply_snapshot_survives_original_deletion() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let cmid1 = ClientMessageId::generate();
    let original = storage
        .insert_message(text_message(
            group,
            teacher,
            &cmid1,
            "original text",
            Utc::now(),
        ))
        .await
        .expect("insert original");

    let cmid2 = ClientMessageId::generate();
    let reply = StoredReply {
        message_id: original,
        sender_name: "ms-frizzle".to_string(),
        preview: "original text".to_string(),
    };
    let reply_id = storage
        .insert_message(NewMessage {
            group_id: group,
            sender_id: teacher,
            client_message_id: &cmid2,
            kind: MessageKind::Text,
            body: Some("agreed"),
            attachment: None,
            reply: Some(&reply),
            created_at: Utc::now(),
        })
        .await
        .expect("insert reply");

    storage
        .soft_delete_message(original)
        .await
        .expect("delete original");

    let stored_reply = storage
        .find_message(reply_id)
        .await
        .expect("find")
        .expect("exists");
    let snapshot = stored_reply.reply.expect("snapshot kept");
    assert_eq!(snapshot.sender_name, "ms-frizzle");
    assert_eq!(snapshot.preview, "original text");
}

#[tokio::test]
async fn mark_seen_is_monotonic() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let t1 = Utc::now();
    let earlier = t1 - Duration::seconds(30);

    assert!(storage.mark_seen(teacher, group, t1).await.expect("seen"));
    assert!(!storage
        .mark_seen(teacher, group, earlier)
        .await
        .expect("seen"));

    let stored = storage
        .read_state(teacher, group)
        .await
        .expect("read state")
        .expect("exists");
    assert_eq!(stored, t1);
}

#[tokio::test]
async fn unread_count_ignores_own_and_seen_messages() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;
    let student = storage
        .create_user("bob", Role::Student, Some("3b"))
        .await
        .expect("user");
    storage
        .add_group_member(group, student)
        .await
        .expect("member");

    let base = Utc::now();
    for i in 0..2 {
        let cmid = ClientMessageId::generate();
        storage
            .insert_message(text_message(
                group,
                teacher,
                &cmid,
                "from teacher",
                base + Duration::milliseconds(i),
            ))
            .await
            .expect("insert");
    }
    let cmid = ClientMessageId::generate();
    storage
        .insert_message(text_message(
            group,
            student,
            &cmid,
            "from me",
            base + Duration::milliseconds(5),
        ))
        .await
        .expect("insert");

    assert_eq!(
        storage.unread_count(student, group).await.expect("count"),
        2
    );

    storage
        .mark_seen(student, group, base + Duration::milliseconds(1))
        .await
        .expect("seen");
    assert_eq!(
        storage.unread_count(student, group).await.expect("count"),
        0
    );
}

#[tokio::test]
async fn tag_criteria_grant_membership_without_roster_entry() {
    let storage = mem().await;
    let teacher = storage
        .create_user("ms-frizzle", Role::Teacher, None)
        .await
        .expect("user");
    let group = storage
        .create_group("class-3b", teacher, None, None, Some("3b"))
        .await
        .expect("group");

    let in_class = storage
        .create_user("carol", Role::Student, Some("3b"))
        .await
        .expect("user");
    let other_class = storage
        .create_user("dave", Role::Student, Some("4a"))
        .await
        .expect("user");

    assert!(storage.is_member(group, in_class).await.expect("member"));
    assert!(!storage
        .is_member(group, other_class)
        .await
        .expect("member"));

    let groups = storage
        .list_groups_for_user(in_class)
        .await
        .expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_id, group);
}

#[tokio::test]
async fn deleting_group_cascades_messages_and_read_state() {
    let storage = mem().await;
    let (teacher, group) = seed_group(&storage).await;

    let cmid = ClientMessageId::generate();
    let id = storage
        .insert_message(text_message(group, teacher, &cmid, "bye", Utc::now()))
        .await
        .expect("insert");
    storage
        .mark_seen(teacher, group, Utc::now())
        .await
        .expect("seen");

    assert!(storage.delete_group(group).await.expect("delete"));
    assert!(storage.group_meta(group).await.expect("meta").is_none());
    assert!(storage.find_message(id).await.expect("find").is_none());
    assert!(storage
        .read_state(teacher, group)
        .await
        .expect("read state")
        .is_none());
}

#[tokio::test]
async fn update_group_applies_partial_changes() {
    let storage = mem().await;
    let (_, group) = seed_group(&storage).await;

    let changed = storage
        .update_group(
            group,
            &GroupChanges {
                name: Some("science-3b-renamed".to_string()),
                avatar_url: Some("https://cdn.example/avatar.png".to_string()),
                ..GroupChanges::default()
            },
        )
        .await
        .expect("update");
    assert!(changed);

    let meta = storage
        .group_meta(group)
        .await
        .expect("meta")
        .expect("exists");
    assert_eq!(meta.name, "science-3b-renamed");
    assert_eq!(meta.theme_tag.as_deref(), Some("green"));
    assert_eq!(
        meta.avatar_url.as_deref(),
        Some("https://cdn.example/avatar.png")
    );
}
