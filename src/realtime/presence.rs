use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

/// Which users currently hold live socket connections, and on how many
/// devices. Process-local; a restart means everyone just disconnected.
#[derive(Default)]
pub struct PresenceRegistry {
    handles: DashMap<Uuid, HashSet<Uuid>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection handle under the user. Returns true when this
    /// is the user's first live handle, i.e. the offline -> online transition.
    pub fn connect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut entry = self.handles.entry(user_id).or_default();
        let came_online = entry.is_empty();
        entry.insert(conn_id);
        came_online
    }

    /// Removes a handle. Returns true only when the user's *last* handle
    /// closed; a user with another tab open stays online.
    pub fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let went_offline = match self.handles.get_mut(&user_id) {
            Some(mut entry) => entry.remove(&conn_id) && entry.is_empty(),
            None => false,
        };
        if went_offline {
            self.handles.remove_if(&user_id, |_, set| set.is_empty());
        }
        went_offline
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.handles.get(&user_id).is_some_and(|set| !set.is_empty())
    }

    /// Every live connection handle the user holds.
    pub fn connections(&self, user_id: Uuid) -> Vec<Uuid> {
        self.handles
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
