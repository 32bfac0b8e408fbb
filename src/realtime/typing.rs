use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use super::rooms::RoomKey;

/// Who is currently flagged as typing, per room. A flag must die on message
/// send, on room leave, and on full disconnect; a survivor on any of those
/// paths is a stuck "is typing…" indicator.
#[derive(Default)]
pub struct TypingRegistry {
    typists: DashMap<RoomKey, HashSet<Uuid>>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the flag was newly set.
    pub fn start(&self, room: RoomKey, user_id: Uuid) -> bool {
        self.typists.entry(room).or_default().insert(user_id)
    }

    /// Returns true when the user actually had a live flag in the room.
    pub fn stop(&self, room: RoomKey, user_id: Uuid) -> bool {
        let was_typing = match self.typists.get_mut(&room) {
            Some(mut set) => set.remove(&user_id),
            None => false,
        };
        self.typists.remove_if(&room, |_, set| set.is_empty());
        was_typing
    }

    pub fn list(&self, room: RoomKey) -> Vec<Uuid> {
        self.typists
            .get(&room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Clears every flag the user holds; returns the rooms that had one so
    /// callers can tell the remaining members.
    pub fn clear_user(&self, user_id: Uuid) -> Vec<RoomKey> {
        let mut cleared = Vec::new();
        self.typists.retain(|room, set| {
            if set.remove(&user_id) {
                cleared.push(*room);
            }
            !set.is_empty()
        });
        cleared
    }
}
