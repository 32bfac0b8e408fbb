use std::sync::Arc;

use axum::{debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use uuid::Uuid;

use crate::{session::USER_ID, store::{ChatStore, Role}, AppResult, AppState};

/// The platform's hosted auth issues the access token; this endpoint only
/// exchanges it for a cookie session.
#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    access_token: String,
}

#[derive(Serialize)]
pub(crate) struct LoginResponse {
    user_id: Uuid,
    role: Role,
    tenant_id: Uuid,
}

#[debug_handler(state = AppState)]
pub(crate) async fn login(
    State(store): State<Arc<dyn ChatStore>>,
    session: Session,
    Json(LoginRequest { access_token }): Json<LoginRequest>,
) -> AppResult<Response> {
    let Some(user) = store.user_for_access_token(&access_token).await? else {
        return Ok((StatusCode::UNAUTHORIZED, "invalid access token").into_response());
    };

    session.insert(USER_ID, user.id.to_string()).await?;
    tracing::info!(user_id = %user.id, "session established");

    Ok(Json(LoginResponse {
        user_id: user.id,
        role: user.role,
        tenant_id: user.tenant_id,
    })
    .into_response())
}
