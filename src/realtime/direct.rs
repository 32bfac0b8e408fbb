//! The 1:1 conversation protocol: join/leave, sends, typing indicators,
//! read receipts and unread-count propagation.

use uuid::Uuid;

use crate::{
    error::WsError,
    store::{ChatStore, Conversation},
};

use super::{event::ServerEvent, rooms::RoomKey, Identity, RealtimeState};

/// Opening a conversation implies reading it: joining marks everything
/// addressed to the joiner as read and tells both sides.
pub(crate) async fn join(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    conversation_id: Uuid,
) -> Result<(), WsError> {
    let conversation = fetch_for_participant(store, identity, conversation_id).await?;
    rt.rooms().join(conn_id, RoomKey::Conversation(conversation_id));
    rt.rooms()
        .send_to_connection(conn_id, &ServerEvent::JoinedConversation { conversation_id });
    run_read_protocol(rt, store, identity, &conversation).await
}

pub(crate) fn leave(
    rt: &RealtimeState,
    identity: &Identity,
    conn_id: Uuid,
    conversation_id: Uuid,
) -> Result<(), WsError> {
    let room = RoomKey::Conversation(conversation_id);
    rt.rooms().leave(conn_id, room);
    if rt.typing().stop(room, identity.id) {
        rt.rooms().broadcast(
            room,
            &ServerEvent::StoppedTyping { conversation_id, user_id: identity.id },
        );
    }
    rt.rooms().broadcast(
        room,
        &ServerEvent::LeftConversation { conversation_id, user_id: identity.id },
    );
    Ok(())
}

pub(crate) async fn send(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conversation_id: Uuid,
    text: &str,
) -> Result<(), WsError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(WsError::ValidationFailed("message text must not be empty".to_owned()));
    }

    let conversation = fetch_for_participant(store, identity, conversation_id).await?;
    let receiver_id = conversation
        .peer_of(identity.id)
        .ok_or_else(|| WsError::NotFound("conversation not found".to_owned()))?;
    let room = RoomKey::Conversation(conversation_id);

    // the sender stopped typing the moment they hit send; this must hold
    // even when the insert below fails
    if rt.typing().stop(room, identity.id) {
        rt.rooms().broadcast(
            room,
            &ServerEvent::StoppedTyping { conversation_id, user_id: identity.id },
        );
    }

    let message = store
        .insert_message(conversation_id, identity.id, receiver_id, text)
        .await?;
    rt.rooms().broadcast(room, &ServerEvent::NewMessage { message: message.clone() });

    // personal channel: the receiver hears about it even with the
    // conversation closed, and the count comes fresh from the store
    let unread_count = store.unread_in_conversation(conversation_id, receiver_id).await?;
    rt.notify_user(
        receiver_id,
        &ServerEvent::MessageNotification { conversation_id, message, unread_count },
    );
    Ok(())
}

pub(crate) async fn typing(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    conversation_id: Uuid,
    started: bool,
) -> Result<(), WsError> {
    fetch_for_participant(store, identity, conversation_id).await?;
    let room = RoomKey::Conversation(conversation_id);
    let changed = if started {
        rt.typing().start(room, identity.id)
    } else {
        rt.typing().stop(room, identity.id)
    };
    if changed {
        let event = if started {
            ServerEvent::Typing { conversation_id, user_id: identity.id }
        } else {
            ServerEvent::StoppedTyping { conversation_id, user_id: identity.id }
        };
        rt.rooms().broadcast_except(room, conn_id, &event);
    }
    Ok(())
}

/// Explicit client-triggered twin of the join-time auto-read.
pub(crate) async fn mark_as_read(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conversation_id: Uuid,
) -> Result<(), WsError> {
    let conversation = fetch_for_participant(store, identity, conversation_id).await?;
    run_read_protocol(rt, store, identity, &conversation).await
}

async fn fetch_for_participant(
    store: &dyn ChatStore,
    identity: &Identity,
    conversation_id: Uuid,
) -> Result<Conversation, WsError> {
    store
        .get_conversation(conversation_id, identity.id)
        .await?
        .ok_or_else(|| WsError::NotFound("conversation not found".to_owned()))
}

/// Marks everything unread-to-me read, notifies the peer, and pushes my
/// recomputed unread count. Both derive from persisted state at this
/// moment; a racing send from the peer may stay unread, which is correct.
async fn run_read_protocol(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conversation: &Conversation,
) -> Result<(), WsError> {
    let changed = store.mark_read(conversation.id, identity.id).await?;
    if changed.is_empty() {
        return Ok(());
    }

    if let Some(peer_id) = conversation.peer_of(identity.id) {
        rt.notify_user(
            peer_id,
            &ServerEvent::MessagesRead {
                conversation_id: conversation.id,
                reader_id: identity.id,
                message_ids: changed,
            },
        );
    }

    let count = store.unread_in_conversation(conversation.id, identity.id).await?;
    rt.notify_user(identity.id, &ServerEvent::UnreadCount { conversation_id: conversation.id, count });
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use crate::error::StoreError;
    use crate::store::{DirectMessage, MockChatStore, Role};

    use super::*;

    struct Peer {
        identity: Identity,
        conn_id: Uuid,
        rx: UnboundedReceiver<String>,
    }

    fn connect(rt: &RealtimeState, role: Role, tenant_id: Uuid) -> Peer {
        let identity = Identity { id: Uuid::now_v7(), role, tenant_id };
        let conn_id = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        rt.rooms().register(conn_id, identity.id, tx);
        rt.presence().connect(identity.id, conn_id);
        Peer { identity, conn_id, rx }
    }

    fn conversation_between(student: &Identity, counsellor: &Identity) -> Conversation {
        Conversation {
            id: Uuid::now_v7(),
            student_id: student.id,
            counsellor_id: counsellor.id,
            tenant_id: student.tenant_id,
            created_at: Utc::now(),
            last_message_at: None,
        }
    }

    fn recv_events(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn join_runs_the_read_protocol_for_both_sides() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let mut student = connect(&rt, Role::Student, tenant);
        let mut counsellor = connect(&rt, Role::Counsellor, tenant);
        let conversation = conversation_between(&student.identity, &counsellor.identity);
        let conversation_id = conversation.id;

        let read_ids = vec![Uuid::now_v7(), Uuid::now_v7()];
        let mut store = MockChatStore::new();
        {
            let conversation = conversation.clone();
            store
                .expect_get_conversation()
                .returning(move |_, _| Ok(Some(conversation.clone())));
        }
        {
            let read_ids = read_ids.clone();
            store.expect_mark_read().returning(move |_, _| Ok(read_ids.clone()));
        }
        store.expect_unread_in_conversation().returning(|_, _| Ok(0));

        join(&rt, &store, &student.identity, student.conn_id, conversation_id)
            .await
            .unwrap();

        let student_events = recv_events(&mut student.rx);
        assert_eq!(student_events[0]["event"], "joined_conversation");
        let unread = student_events.iter().find(|e| e["event"] == "unread_count").unwrap();
        assert_eq!(unread["data"]["count"], 0);

        let counsellor_events = recv_events(&mut counsellor.rx);
        let read = counsellor_events.iter().find(|e| e["event"] == "messages_read").unwrap();
        assert_eq!(read["data"]["reader_id"], student.identity.id.to_string());
        assert_eq!(read["data"]["message_ids"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn join_rejects_a_non_participant() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let stranger = connect(&rt, Role::Student, tenant);

        let mut store = MockChatStore::new();
        store.expect_get_conversation().returning(|_, _| Ok(None));

        let result = join(&rt, &store, &stranger.identity, stranger.conn_id, Uuid::now_v7()).await;
        assert!(matches!(result, Err(WsError::NotFound(_))));
        assert!(!rt.rooms().has_joined(stranger.conn_id, RoomKey::Conversation(Uuid::now_v7())));
    }

    #[tokio::test]
    async fn a_failed_send_still_clears_typing() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let student = connect(&rt, Role::Student, tenant);
        let mut counsellor = connect(&rt, Role::Counsellor, tenant);
        let conversation = conversation_between(&student.identity, &counsellor.identity);
        let conversation_id = conversation.id;
        let room = RoomKey::Conversation(conversation_id);

        rt.rooms().join(counsellor.conn_id, room);
        rt.typing().start(room, student.identity.id);

        let mut store = MockChatStore::new();
        store
            .expect_get_conversation()
            .returning(move |_, _| Ok(Some(conversation.clone())));
        store
            .expect_insert_message()
            .returning(|_, _, _, _| Err(StoreError::Corrupt("insert failed".to_owned())));

        let result = send(&rt, &store, &student.identity, conversation_id, "hello").await;
        assert!(matches!(result, Err(WsError::Collaborator(_))));

        // the user did stop typing even though the send failed
        assert!(rt.typing().list(room).is_empty());
        let events = recv_events(&mut counsellor.rx);
        assert!(events.iter().any(|e| e["event"] == "stopped_typing"));
    }

    #[tokio::test]
    async fn send_broadcasts_and_notifies_with_a_fresh_count() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let mut student = connect(&rt, Role::Student, tenant);
        let mut counsellor = connect(&rt, Role::Counsellor, tenant);
        let conversation = conversation_between(&student.identity, &counsellor.identity);
        let conversation_id = conversation.id;
        let room = RoomKey::Conversation(conversation_id);

        rt.rooms().join(student.conn_id, room);
        rt.rooms().join(counsellor.conn_id, room);

        let sender_id = student.identity.id;
        let receiver_id = counsellor.identity.id;
        let mut store = MockChatStore::new();
        store
            .expect_get_conversation()
            .returning(move |_, _| Ok(Some(conversation.clone())));
        store.expect_insert_message().returning(move |conversation_id, sender, receiver, text| {
            Ok(DirectMessage {
                id: Uuid::now_v7(),
                conversation_id,
                sender_id: sender,
                receiver_id: receiver,
                content: text.to_owned(),
                is_read: false,
                read_at: None,
                created_at: Utc::now(),
            })
        });
        store.expect_unread_in_conversation().returning(|_, _| Ok(3));

        send(&rt, &store, &student.identity, conversation_id, "how was today?")
            .await
            .unwrap();

        let student_events = recv_events(&mut student.rx);
        assert!(student_events.iter().any(|e| e["event"] == "new_message"));

        let counsellor_events = recv_events(&mut counsellor.rx);
        let new_message = counsellor_events.iter().find(|e| e["event"] == "new_message").unwrap();
        assert_eq!(new_message["data"]["message"]["sender_id"], sender_id.to_string());
        let notification = counsellor_events
            .iter()
            .find(|e| e["event"] == "message_notification")
            .unwrap();
        assert_eq!(notification["data"]["unread_count"], 3);
        assert_eq!(notification["data"]["message"]["receiver_id"], receiver_id.to_string());
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_touching_the_store() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let student = connect(&rt, Role::Student, tenant);

        let store = MockChatStore::new();
        let result = send(&rt, &store, &student.identity, Uuid::now_v7(), "   ").await;
        assert!(matches!(result, Err(WsError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn typing_reaches_the_peer_but_not_the_actor() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let mut student = connect(&rt, Role::Student, tenant);
        let mut counsellor = connect(&rt, Role::Counsellor, tenant);
        let conversation = conversation_between(&student.identity, &counsellor.identity);
        let conversation_id = conversation.id;
        let room = RoomKey::Conversation(conversation_id);
        rt.rooms().join(student.conn_id, room);
        rt.rooms().join(counsellor.conn_id, room);

        let mut store = MockChatStore::new();
        store
            .expect_get_conversation()
            .returning(move |_, _| Ok(Some(conversation.clone())));

        typing(&rt, &store, &student.identity, student.conn_id, conversation_id, true)
            .await
            .unwrap();

        assert_eq!(rt.typing().list(room), vec![student.identity.id]);
        assert!(recv_events(&mut student.rx).is_empty());
        let events = recv_events(&mut counsellor.rx);
        assert_eq!(events[0]["event"], "typing");
    }

    #[tokio::test]
    async fn mark_as_read_with_nothing_unread_stays_quiet() {
        let rt = RealtimeState::new();
        let tenant = Uuid::now_v7();
        let student = connect(&rt, Role::Student, tenant);
        let mut counsellor = connect(&rt, Role::Counsellor, tenant);
        let conversation = conversation_between(&student.identity, &counsellor.identity);
        let conversation_id = conversation.id;

        let mut store = MockChatStore::new();
        store
            .expect_get_conversation()
            .returning(move |_, _| Ok(Some(conversation.clone())));
        store.expect_mark_read().returning(|_, _| Ok(Vec::new()));

        mark_as_read(&rt, &store, &student.identity, conversation_id).await.unwrap();
        assert!(recv_events(&mut counsellor.rx).is_empty());
    }
}
