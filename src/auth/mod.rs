mod login;
mod logout;
mod token;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login::login))
        .route("/auth/logout", post(logout::logout))
        .route("/auth/socket-token", get(token::socket_token))
}
