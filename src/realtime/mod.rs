//! The realtime layer: socket handshake, room management, the two chat
//! protocols, and the process-local presence/typing registries.

mod bridge;
mod community;
mod direct;
mod event;
mod presence;
mod rooms;
mod typing;
mod ws;

pub use bridge::{Identity, SessionBridge};
pub use event::{ClientEvent, CommunityMessagePayload, ServerEvent};
pub use presence::PresenceRegistry;
pub use rooms::{RoomKey, RoomRegistry};
pub use typing::TypingRegistry;

use std::sync::Arc;

use axum::{routing::get, Router};
use uuid::Uuid;

use crate::AppState;

/// Everything the socket server owns in-process. Rebuilt empty on restart:
/// a restart is equivalent to "everyone just disconnected".
#[derive(Clone, Default)]
pub struct RealtimeState {
    inner: Arc<RealtimeInner>,
}

#[derive(Default)]
struct RealtimeInner {
    presence: PresenceRegistry,
    typing: TypingRegistry,
    rooms: RoomRegistry,
}

impl RealtimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn typing(&self) -> &TypingRegistry {
        &self.inner.typing
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.inner.rooms
    }

    /// Delivers an event to every live connection the user has, on any
    /// device. This is the personal notification channel.
    pub fn notify_user(&self, user_id: Uuid, event: &ServerEvent) {
        for conn_id in self.presence().connections(user_id) {
            self.rooms().send_to_connection(conn_id, event);
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::socket_handler))
}
