use super::*;
use shared::domain::Role;

async fn setup() -> (Arc<Hub>, UserId, UserId, GroupId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let teacher = storage
        .create_user("ms-frizzle", Role::Teacher, None)
        .await
        .expect("teacher");
    let student = storage
        .create_user("arnold", Role::Student, Some("3b"))
        .await
        .expect("student");
    let group = storage
        .create_group("science-3b", teacher, None, None, None)
        .await
        .expect("group");
    storage
        .add_group_member(group, student)
        .await
        .expect("roster");
    (Hub::new(storage), teacher, student, group)
}

fn created_message(event: ServerEvent) -> MessagePayload {
    match event {
        ServerEvent::MessageCreated { message } => message,
        other => panic!("expected message_created, got {other:?}"),
    }
}

#[tokio::test]
async fn all_sessions_observe_sends_in_acceptance_order() {
    let (hub, teacher, student, group) = setup().await;

    let mut rx_a = hub.join(teacher, group).await.expect("join a");
    let mut rx_b = hub.join(student, group).await.expect("join b");

    let mut accepted = Vec::new();
    for i in 0..5 {
        let cmid = ClientMessageId::generate();
        let payload = hub
            .send(teacher, group, &cmid, &MessageDraft::text(format!("m{i}")))
            .await
            .expect("send");
        accepted.push(payload.message_id);
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let mut observed = Vec::new();
        for _ in 0..5 {
            let event = rx.recv().await.expect("event");
            observed.push(created_message(event).message_id);
        }
        assert_eq!(observed, accepted);
    }
}

#[tokio::test]
async fn join_requires_membership() {
    let (hub, _, _, group) = setup().await;
    let outsider = hub
        .storage()
        .create_user("stranger", Role::Student, Some("4a"))
        .await
        .expect("user");

    let err = hub.join(outsider, group).await.expect_err("must fail");
    assert!(matches!(err, HubError::Forbidden(_)));
}

#[tokio::test]
async fn media_with_body_is_rejected_and_never_broadcast() {
    let (hub, teacher, student, group) = setup().await;
    let mut rx = hub.join(student, group).await.expect("join");

    let cmid = ClientMessageId::generate();
    let draft = MessageDraft {
        kind: MessageKind::Image,
        body: Some("caption".to_string()),
        attachment: Some(AttachmentRef {
            url: "https://files.example/i.png".to_string(),
            filename: "i.png".to_string(),
        }),
        reply_to: None,
    };

    let err = hub
        .send(teacher, group, &cmid, &draft)
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Validation(_)));

    assert!(
        matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
        "rejected send must not reach any session"
    );
    let persisted = hub
        .storage()
        .find_message_by_client_id(group, teacher, &cmid)
        .await
        .expect("lookup");
    assert!(persisted.is_none());
}

#[tokio::test]
async fn text_with_attachment_is_rejected() {
    let (hub, teacher, _, group) = setup().await;
    let cmid = ClientMessageId::generate();
    let draft = MessageDraft {
        kind: MessageKind::Text,
        body: Some("hello".to_string()),
        attachment: Some(AttachmentRef {
            url: "https://files.example/x".to_string(),
            filename: "x".to_string(),
        }),
        reply_to: None,
    };
    let err = hub
        .send(teacher, group, &cmid, &draft)
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Validation(_)));
}

#[tokio::test]
async fn resend_with_same_client_message_id_returns_existing() {
    let (hub, teacher, student, group) = setup().await;
    let mut rx = hub.join(student, group).await.expect("join");

    let cmid = ClientMessageId::generate();
    let first = hub
        .send(teacher, group, &cmid, &MessageDraft::text("once"))
        .await
        .expect("send");
    let second = hub
        .send(teacher, group, &cmid, &MessageDraft::text("once"))
        .await
        .expect("resend");

    assert_eq!(first.message_id, second.message_id);

    // Exactly one broadcast for the two attempts.
    let _ = rx.recv().await.expect("first event");
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn broadcast_embeds_client_message_id_for_reconciliation() {
    let (hub, teacher, student, group) = setup().await;
    let mut rx = hub.join(student, group).await.expect("join");

    let cmid = ClientMessageId::generate();
    hub.send(teacher, group, &cmid, &MessageDraft::text("hi"))
        .await
        .expect("send");

    let message = created_message(rx.recv().await.expect("event"));
    assert_eq!(message.client_message_id, Some(cmid));
    assert_eq!(message.sender_name.as_deref(), Some("ms-frizzle"));
}

#[tokio::test]
async fn reply_snapshot_is_captured_at_send_time() {
    let (hub, teacher, student, group) = setup().await;

    let original = hub
        .send(
            teacher,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::text("bring your worksheets tomorrow"),
        )
        .await
        .expect("send original");

    let reply = hub
        .send(
            student,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::text("will do").replying_to(original.message_id),
        )
        .await
        .expect("send reply");

    let snapshot = reply.reply_to.expect("snapshot");
    assert_eq!(snapshot.message_id, original.message_id);
    assert_eq!(snapshot.sender_name, "ms-frizzle");
    assert_eq!(snapshot.preview, "bring your worksheets tomorrow");

    // Deleting the original leaves the stored snapshot intact.
    hub.delete(teacher, original.message_id)
        .await
        .expect("delete original");
    let stored = hub
        .storage()
        .find_message(reply.message_id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(
        stored.reply.expect("snapshot kept").preview,
        "bring your worksheets tomorrow"
    );
}

#[tokio::test]
async fn reply_to_foreign_group_message_is_rejected() {
    let (hub, teacher, _, group) = setup().await;
    let other_group = hub
        .storage()
        .create_group("staff-room", teacher, None, None, None)
        .await
        .expect("group");
    let foreign = hub
        .send(
            teacher,
            other_group,
            &ClientMessageId::generate(),
            &MessageDraft::text("staff only"),
        )
        .await
        .expect("send");

    let err = hub
        .send(
            teacher,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::text("reply").replying_to(foreign.message_id),
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Validation(_)));
}

#[tokio::test]
async fn only_sender_may_edit_and_only_text() {
    let (hub, teacher, student, group) = setup().await;

    let text = hub
        .send(
            teacher,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::text("tpyo"),
        )
        .await
        .expect("send");

    let err = hub
        .edit(student, text.message_id, "hijack")
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Forbidden(_)));

    let media = hub
        .send(
            teacher,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::media(
                MessageKind::File,
                AttachmentRef {
                    url: "https://files.example/w.pdf".to_string(),
                    filename: "w.pdf".to_string(),
                },
            ),
        )
        .await
        .expect("send media");
    let err = hub
        .edit(teacher, media.message_id, "caption")
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Validation(_)));

    let mut rx = hub.join(student, group).await.expect("join");
    hub.edit(teacher, text.message_id, "typo")
        .await
        .expect("edit");
    match rx.recv().await.expect("event") {
        ServerEvent::MessageEdited {
            message_id,
            new_body,
            ..
        } => {
            assert_eq!(message_id, text.message_id);
            assert_eq!(new_body, "typo");
        }
        other => panic!("expected message_edited, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_broadcasts_identifier_only_and_sticks() {
    let (hub, teacher, student, group) = setup().await;
    let message = hub
        .send(
            teacher,
            group,
            &ClientMessageId::generate(),
            &MessageDraft::text("gone soon"),
        )
        .await
        .expect("send");

    let err = hub
        .delete(student, message.message_id)
        .await
        .expect_err("must fail");
    assert!(matches!(err, HubError::Forbidden(_)));

    let mut rx = hub.join(student, group).await.expect("join");
    hub.delete(teacher, message.message_id)
        .await
        .expect("delete");
    match rx.recv().await.expect("event") {
        ServerEvent::MessageDeleted { message_id, .. } => {
            assert_eq!(message_id, message.message_id)
        }
        other => panic!("expected message_deleted, got {other:?}"),
    }

    let err = hub
        .edit(teacher, message.message_id, "no")
        .await
        .expect_err("deleted messages cannot be edited");
    assert!(matches!(err, HubError::NotFound(_)));
}

#[tokio::test]
async fn mark_seen_clears_unread_and_never_regresses() {
    let (hub, teacher, student, group) = setup().await;

    hub.send(
        teacher,
        group,
        &ClientMessageId::generate(),
        &MessageDraft::text("announcement"),
    )
    .await
    .expect("send");

    assert_eq!(
        hub.storage()
            .unread_count(student, group)
            .await
            .expect("count"),
        1
    );

    hub.mark_seen(student, group).await.expect("seen");
    let boundary = hub
        .storage()
        .read_state(student, group)
        .await
        .expect("read state")
        .expect("exists");
    assert_eq!(
        hub.storage()
            .unread_count(student, group)
            .await
            .expect("count"),
        0
    );

    // Calling again can only move the boundary forward.
    hub.mark_seen(student, group).await.expect("seen again");
    let advanced = hub
        .storage()
        .read_state(student, group)
        .await
        .expect("read state")
        .expect("exists");
    assert!(advanced >= boundary);
}

#[tokio::test]
async fn concurrent_sends_to_one_group_serialize_without_loss() {
    let (hub, teacher, student, group) = setup().await;
    let mut rx = hub.join(student, group).await.expect("join");

    let mut handles = Vec::new();
    for i in 0..8 {
        let hub = Arc::clone(&hub);
        handles.push(tokio::spawn(async move {
            hub.send(
                teacher,
                group,
                &ClientMessageId::generate(),
                &MessageDraft::text(format!("burst {i}")),
            )
            .await
            .expect("send")
            .message_id
        }));
    }
    let mut accepted = Vec::new();
    for handle in handles {
        accepted.push(handle.await.expect("task"));
    }

    let mut observed = Vec::new();
    for _ in 0..8 {
        observed.push(created_message(rx.recv().await.expect("event")).message_id);
    }

    // Broadcast order must be strictly increasing acceptance order even
    // though the sends raced.
    let mut sorted = observed.clone();
    sorted.sort();
    assert_eq!(observed, sorted);

    accepted.sort();
    assert_eq!(accepted, sorted);
}
