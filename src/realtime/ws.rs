//! Socket bootstrap: handshake authentication, the per-connection event
//! loop, and disconnect cleanup.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::WsError, store::ChatStore, AppState};

use super::{
    community, direct,
    event::{ClientEvent, ServerEvent},
    rooms::RoomKey,
    Identity, RealtimeState,
};

#[derive(Deserialize)]
pub(crate) struct SocketQuery {
    token: Option<String>,
}

pub(crate) async fn socket_handler(
    State(state): State<AppState>,
    Query(SocketQuery { token }): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // a bad credential is a connection-level failure: refuse the upgrade
    // before any event handler can run
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing socket token").into_response();
    };
    let identity = match state.bridge.authenticate(state.store.as_ref(), &token).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(%err, "socket handshake rejected");
            return (StatusCode::UNAUTHORIZED, err.client_message()).into_response();
        }
    };

    let store = state.store.clone();
    let rt = state.realtime.clone();
    ws.on_upgrade(move |socket| run_connection(socket, rt, store, identity))
}

async fn run_connection(
    socket: WebSocket,
    rt: RealtimeState,
    store: Arc<dyn ChatStore>,
    identity: Identity,
) {
    let conn_id = Uuid::now_v7();
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<String>();

    rt.rooms().register(conn_id, identity.id, outbox);
    if rt.presence().connect(identity.id, conn_id) {
        rt.rooms().broadcast_all(&ServerEvent::UserOnline { user_id: identity.id });
    }
    tracing::info!(user_id = %identity.id, %conn_id, "socket connected");

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            if sink.send(frame.into()).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else { continue };
        let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => event,
            Err(_) => {
                rt.rooms().send_to_connection(conn_id, &ServerEvent::error("unrecognized event"));
                continue;
            }
        };

        // events on one connection are handled in arrival order
        if let Err(err) = dispatch(&rt, store.as_ref(), &identity, conn_id, event).await {
            match &err {
                WsError::Collaborator(detail) => {
                    tracing::error!(user_id = %identity.id, %detail, "store failure");
                }
                other => {
                    tracing::debug!(user_id = %identity.id, %other, "rejected socket action");
                }
            }
            // scoped to the initiator; one failed action never disconnects
            // the socket or touches other participants
            rt.rooms().send_to_connection(conn_id, &ServerEvent::error(err.client_message()));
        }
    }

    cleanup(&rt, &identity, conn_id);
    forward_task.abort();
}

async fn dispatch(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    event: ClientEvent,
) -> Result<(), WsError> {
    match event {
        ClientEvent::JoinConversation { conversation_id } => {
            direct::join(rt, store, identity, conn_id, conversation_id).await
        }
        ClientEvent::LeaveConversation { conversation_id } => {
            direct::leave(rt, identity, conn_id, conversation_id)
        }
        ClientEvent::SendMessage { conversation_id, text } => {
            direct::send(rt, store, identity, conversation_id, &text).await
        }
        ClientEvent::Typing { conversation_id } => {
            direct::typing(rt, store, identity, conn_id, conversation_id, true).await
        }
        ClientEvent::StopTyping { conversation_id } => {
            direct::typing(rt, store, identity, conn_id, conversation_id, false).await
        }
        ClientEvent::MarkAsRead { conversation_id } => {
            direct::mark_as_read(rt, store, identity, conversation_id).await
        }
        ClientEvent::JoinCommunity { community_id } => {
            community::join(rt, store, identity, conn_id, community_id).await
        }
        ClientEvent::LeaveCommunity { community_id } => {
            community::leave(rt, identity, conn_id, community_id)
        }
        ClientEvent::SendCommunityMessage { community_id, text } => {
            community::send(rt, store, identity, conn_id, community_id, &text).await
        }
        ClientEvent::CommunityTyping { community_id } => {
            community::typing(rt, store, identity, conn_id, community_id, true).await
        }
        ClientEvent::CommunityStopTyping { community_id } => {
            community::typing(rt, store, identity, conn_id, community_id, false).await
        }
        ClientEvent::GetCommunityMessages { community_id, limit, before_id } => {
            community::history(rt, store, identity, conn_id, community_id, limit, before_id).await
        }
    }
}

/// Runs when the read loop ends, however it ends. Registries must come out
/// consistent even when this races other handlers for the same user.
fn cleanup(rt: &RealtimeState, identity: &Identity, conn_id: Uuid) {
    let joined = rt.rooms().unregister(conn_id);

    if rt.presence().disconnect(identity.id, conn_id) {
        // last handle: typing flags die with the user, and exactly one
        // offline broadcast fires for the transition
        for room in rt.typing().clear_user(identity.id) {
            let event = match room {
                RoomKey::Conversation(conversation_id) => ServerEvent::StoppedTyping {
                    conversation_id,
                    user_id: identity.id,
                },
                RoomKey::Community(community_id) => ServerEvent::CommunityStoppedTyping {
                    community_id,
                    username: community::presence_label(identity),
                    role: identity.role,
                },
            };
            rt.rooms().broadcast(room, &event);
        }
        rt.rooms().broadcast_all(&ServerEvent::UserOffline { user_id: identity.id });
    }

    // communities hear about the departure even without an explicit leave
    for room in joined {
        if let RoomKey::Community(community_id) = room {
            community::announce_departure(rt, identity, community_id);
        }
    }
    tracing::info!(user_id = %identity.id, %conn_id, "socket disconnected");
}
