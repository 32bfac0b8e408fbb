//! The lazy-conversation HTTP surface: a student (or counsellor) opens a
//! conversation with a peer on first contact, and lists their own
//! conversations with previews and fresh unread counts.

use std::sync::Arc;

use axum::{
    debug_handler,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{session, store::{ChatStore, Role, UserRecord}, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/conversations", get(list).post(create))
}

#[debug_handler(state = AppState)]
async fn list(
    State(store): State<Arc<dyn ChatStore>>,
    session: Session,
) -> AppResult<Response> {
    let Some(user) = session::current_user(store.as_ref(), &session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let conversations = store.list_conversations_for(user.id, user.tenant_id).await?;
    Ok(Json(conversations).into_response())
}

#[derive(Deserialize)]
struct CreateConversation {
    peer_id: Uuid,
}

#[debug_handler(state = AppState)]
async fn create(
    State(store): State<Arc<dyn ChatStore>>,
    session: Session,
    Json(CreateConversation { peer_id }): Json<CreateConversation>,
) -> AppResult<Response> {
    let Some(user) = session::current_user(store.as_ref(), &session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let Some(peer) = store.get_user(peer_id).await? else {
        return Ok((StatusCode::NOT_FOUND, "user not found").into_response());
    };
    // cross-tenant peers read as absent, not forbidden
    if peer.tenant_id != user.tenant_id {
        return Ok((StatusCode::NOT_FOUND, "user not found").into_response());
    }

    let Some((student, counsellor)) = pair_up(&user, &peer) else {
        return Ok((
            StatusCode::FORBIDDEN,
            "conversations pair a student with a counsellor",
        )
            .into_response());
    };

    let conversation = store
        .find_or_create_conversation(student, counsellor, user.tenant_id)
        .await?;
    Ok(Json(conversation).into_response())
}

fn pair_up(user: &UserRecord, peer: &UserRecord) -> Option<(Uuid, Uuid)> {
    match (user.role, peer.role) {
        (Role::Student, Role::Counsellor) => Some((user.id, peer.id)),
        (Role::Counsellor, Role::Student) => Some((peer.id, user.id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, tenant_id: Uuid) -> UserRecord {
        UserRecord {
            id: Uuid::now_v7(),
            name: "someone".to_owned(),
            role,
            tenant_id,
            anon_handle: "CalmOwl_0001".to_owned(),
        }
    }

    #[test]
    fn pairing_is_role_directional() {
        let tenant = Uuid::now_v7();
        let student = user(Role::Student, tenant);
        let counsellor = user(Role::Counsellor, tenant);

        assert_eq!(pair_up(&student, &counsellor), Some((student.id, counsellor.id)));
        assert_eq!(pair_up(&counsellor, &student), Some((student.id, counsellor.id)));
        assert_eq!(pair_up(&student, &student), None);
        assert_eq!(pair_up(&counsellor, &user(Role::Admin, tenant)), None);
    }
}
