use std::sync::Arc;

use axum::{routing::get, Router};
use campusmind::{auth, conversations, realtime, store::SqliteChatStore, AppState};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("campusmind=debug,info")),
        )
        .init();

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_owned()))
        .await?;

    let store = SqliteChatStore::new(db_pool);
    store.init_schema().await?;

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(8)));

    let app_state = AppState {
        store: Arc::new(store),
        bridge: realtime::SessionBridge::new(),
        realtime: realtime::RealtimeState::new(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(auth::router())
        .merge(conversations::router())
        .merge(realtime::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::permissive());

    let addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}
