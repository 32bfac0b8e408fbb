use std::sync::Arc;

use axum::{debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use tower_sessions::Session;

use crate::{realtime::SessionBridge, session, store::ChatStore, AppResult, AppState};

#[derive(Serialize)]
pub(crate) struct SocketTokenResponse {
    token: String,
}

/// Secure session cookies are invisible to script, and the socket handshake
/// cannot read them either, so an authenticated caller fetches the
/// short-lived connect token here, once per connection attempt.
#[debug_handler(state = AppState)]
pub(crate) async fn socket_token(
    State(store): State<Arc<dyn ChatStore>>,
    State(bridge): State<SessionBridge>,
    session: Session,
) -> AppResult<Response> {
    let Some(user) = session::current_user(store.as_ref(), &session).await? else {
        return Ok((StatusCode::UNAUTHORIZED, "not signed in").into_response());
    };

    let token = bridge.issue(user.id);
    Ok(Json(SocketTokenResponse { token }).into_response())
}
