//! Many-to-many rooms with role-based bypass and anonymized student
//! identities. Sending requires an explicit join: being a member in the
//! store only means "can access", not "is actively viewing".

use uuid::Uuid;

use crate::{
    error::WsError,
    store::{ChatStore, Community, Role},
};

use super::{
    event::{CommunityMessagePayload, ServerEvent},
    rooms::RoomKey,
    Identity, RealtimeState,
};

const MAX_MESSAGE_LEN: usize = 2000;

/// Presence-level label: students are `"anonymous"`, staff show as their
/// role, nobody shows as a name.
pub(crate) fn presence_label(identity: &Identity) -> String {
    match identity.role {
        Role::Student => "anonymous".to_owned(),
        role => role.as_str().to_owned(),
    }
}

pub(crate) async fn join(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    community_id: Uuid,
) -> Result<(), WsError> {
    authorize_access(store, identity, community_id).await?;
    let room = RoomKey::Community(community_id);
    rt.rooms().join(conn_id, room);
    rt.rooms().send_to_connection(conn_id, &ServerEvent::JoinedCommunity { community_id });
    rt.rooms().broadcast_except(
        room,
        conn_id,
        &ServerEvent::UserJoined {
            community_id,
            username: presence_label(identity),
            role: identity.role,
        },
    );
    Ok(())
}

pub(crate) fn leave(
    rt: &RealtimeState,
    identity: &Identity,
    conn_id: Uuid,
    community_id: Uuid,
) -> Result<(), WsError> {
    let room = RoomKey::Community(community_id);
    rt.rooms().leave(conn_id, room);
    rt.typing().stop(room, identity.id);
    rt.rooms().broadcast(
        room,
        &ServerEvent::UserLeft {
            community_id,
            username: presence_label(identity),
            role: identity.role,
        },
    );
    Ok(())
}

/// Room departure announcement for a connection that dropped without an
/// explicit leave.
pub(crate) fn announce_departure(
    rt: &RealtimeState,
    identity: &Identity,
    community_id: Uuid,
) {
    rt.rooms().broadcast(
        RoomKey::Community(community_id),
        &ServerEvent::UserLeft {
            community_id,
            username: presence_label(identity),
            role: identity.role,
        },
    );
}

pub(crate) async fn send(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    community_id: Uuid,
    text: &str,
) -> Result<(), WsError> {
    let room = RoomKey::Community(community_id);
    if !rt.rooms().has_joined(conn_id, room) {
        return Err(WsError::AuthorizationDenied(
            "join the community before sending".to_owned(),
        ));
    }

    let text = text.trim();
    if text.is_empty() {
        return Err(WsError::ValidationFailed("message text must not be empty".to_owned()));
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(WsError::ValidationFailed("message text is too long".to_owned()));
    }

    // registry first: a failed insert must not leave a stuck typing flag
    let was_typing = rt.typing().stop(room, identity.id);

    // display identity resolves at broadcast time, never at storage time
    let display_name = store.resolve_display_name(identity.id, identity.role).await?;
    if was_typing {
        rt.rooms().broadcast_except(
            room,
            conn_id,
            &ServerEvent::CommunityStoppedTyping {
                community_id,
                username: display_name.clone(),
                role: identity.role,
            },
        );
    }

    let message = store
        .insert_community_message(community_id, identity.id, identity.role, text)
        .await?;
    let payload = CommunityMessagePayload::from_message(&message, display_name);
    rt.rooms().broadcast(room, &ServerEvent::CommunityMessage { community_id, message: payload });
    Ok(())
}

pub(crate) async fn typing(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    community_id: Uuid,
    started: bool,
) -> Result<(), WsError> {
    let room = RoomKey::Community(community_id);
    if !rt.rooms().has_joined(conn_id, room) {
        return Err(WsError::AuthorizationDenied("join the community first".to_owned()));
    }

    let changed = if started {
        rt.typing().start(room, identity.id)
    } else {
        rt.typing().stop(room, identity.id)
    };
    if changed {
        let username = store.resolve_display_name(identity.id, identity.role).await?;
        let event = if started {
            ServerEvent::CommunityTyping { community_id, username, role: identity.role }
        } else {
            ServerEvent::CommunityStoppedTyping { community_id, username, role: identity.role }
        };
        rt.rooms().broadcast_except(room, conn_id, &event);
    }
    Ok(())
}

pub(crate) async fn history(
    rt: &RealtimeState,
    store: &dyn ChatStore,
    identity: &Identity,
    conn_id: Uuid,
    community_id: Uuid,
    limit: Option<i64>,
    before_id: Option<Uuid>,
) -> Result<(), WsError> {
    let room = RoomKey::Community(community_id);
    // joined viewers read history; tenant staff may read without joining
    if !rt.rooms().has_joined(conn_id, room) {
        if !identity.role.is_staff() {
            return Err(WsError::AuthorizationDenied("join the community first".to_owned()));
        }
        authorize_access(store, identity, community_id).await?;
    }

    let limit = limit.unwrap_or(50).clamp(1, 100);
    let messages = store.list_community_messages(community_id, limit, before_id).await?;

    let mut payloads = Vec::with_capacity(messages.len());
    for message in &messages {
        let display_name = store
            .resolve_display_name(message.sender_id, message.sender_role)
            .await?;
        payloads.push(CommunityMessagePayload::from_message(message, display_name));
    }
    rt.rooms().send_to_connection(
        conn_id,
        &ServerEvent::CommunityMessages { community_id, messages: payloads },
    );
    Ok(())
}

/// Tenant gate first, membership second. A cross-tenant caller learns
/// nothing about the community, not even that it exists.
async fn authorize_access(
    store: &dyn ChatStore,
    identity: &Identity,
    community_id: Uuid,
) -> Result<Community, WsError> {
    let community = store
        .get_community(community_id)
        .await?
        .ok_or_else(|| WsError::NotFound("community not found".to_owned()))?;
    if community.tenant_id != identity.tenant_id {
        return Err(WsError::AuthorizationDenied("community not found or not joinable".to_owned()));
    }
    if !identity.role.is_staff() && !store.is_member(identity.id, community_id).await? {
        return Err(WsError::AuthorizationDenied(
            "you are not a member of this community".to_owned(),
        ));
    }
    Ok(community)
}
