use std::{collections::HashSet, fmt};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::event::ServerEvent;

/// A logical broadcast group. Conversations and communities live in separate
/// variants so their events can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Conversation(Uuid),
    Community(Uuid),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Conversation(id) => write!(f, "conversation:{id}"),
            RoomKey::Community(id) => write!(f, "community:{id}"),
        }
    }
}

pub type Outbox = mpsc::UnboundedSender<String>;

struct ConnHandle {
    user_id: Uuid,
    outbox: Outbox,
}

/// Maps rooms to the connections actively viewing them. This is transport
/// state: a conversation participant who closes the tab still owns the
/// conversation in the store, they just stop receiving room broadcasts.
#[derive(Default)]
pub struct RoomRegistry {
    connections: DashMap<Uuid, ConnHandle>,
    rooms: DashMap<RoomKey, HashSet<Uuid>>,
    joined: DashMap<Uuid, HashSet<RoomKey>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: Uuid, user_id: Uuid, outbox: Outbox) {
        self.connections.insert(conn_id, ConnHandle { user_id, outbox });
    }

    /// Drops the connection and its subscriptions; returns the rooms it was
    /// in so the caller can announce departures.
    pub fn unregister(&self, conn_id: Uuid) -> Vec<RoomKey> {
        self.connections.remove(&conn_id);
        let rooms: Vec<RoomKey> = self
            .joined
            .remove(&conn_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            if let Some(mut members) = self.rooms.get_mut(room) {
                members.remove(&conn_id);
            }
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        rooms
    }

    pub fn join(&self, conn_id: Uuid, room: RoomKey) {
        self.rooms.entry(room).or_default().insert(conn_id);
        self.joined.entry(conn_id).or_default().insert(room);
        tracing::debug!(%room, %conn_id, "joined room");
    }

    pub fn leave(&self, conn_id: Uuid, room: RoomKey) {
        if let Some(mut members) = self.rooms.get_mut(&room) {
            members.remove(&conn_id);
        }
        self.rooms.remove_if(&room, |_, members| members.is_empty());
        if let Some(mut set) = self.joined.get_mut(&conn_id) {
            set.remove(&room);
        }
    }

    pub fn has_joined(&self, conn_id: Uuid, room: RoomKey) -> bool {
        self.joined
            .get(&conn_id)
            .is_some_and(|set| set.contains(&room))
    }

    pub fn broadcast(&self, room: RoomKey, event: &ServerEvent) {
        self.broadcast_inner(room, None, event);
    }

    /// Broadcast to the room minus one connection, the socket.io
    /// `socket.to(room)` shape, for events the actor shouldn't echo back.
    pub fn broadcast_except(&self, room: RoomKey, skip: Uuid, event: &ServerEvent) {
        self.broadcast_inner(room, Some(skip), event);
    }

    fn broadcast_inner(&self, room: RoomKey, skip: Option<Uuid>, event: &ServerEvent) {
        let Some(frame) = encode(event) else { return };
        let Some(members) = self.rooms.get(&room) else { return };
        for conn_id in members.iter() {
            if Some(*conn_id) == skip {
                continue;
            }
            if let Some(handle) = self.connections.get(conn_id) {
                let _ = handle.outbox.send(frame.clone());
            }
        }
    }

    pub fn send_to_connection(&self, conn_id: Uuid, event: &ServerEvent) {
        let Some(frame) = encode(event) else { return };
        if let Some(handle) = self.connections.get(&conn_id) {
            let _ = handle.outbox.send(frame);
        }
    }

    /// Every live connection, e.g. for global presence transitions.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let Some(frame) = encode(event) else { return };
        for handle in self.connections.iter() {
            let _ = handle.outbox.send(frame.clone());
        }
    }

    pub fn user_of(&self, conn_id: Uuid) -> Option<Uuid> {
        self.connections.get(&conn_id).map(|h| h.user_id)
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::error!(%err, "failed to encode server event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    fn connect(rooms: &RoomRegistry, user_id: Uuid) -> (Uuid, UnboundedReceiver<String>) {
        let conn_id = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        rooms.register(conn_id, user_id, tx);
        (conn_id, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member() {
        let rooms = RoomRegistry::new();
        let room = RoomKey::Community(Uuid::now_v7());
        let (a, mut rx_a) = connect(&rooms, Uuid::now_v7());
        let (b, mut rx_b) = connect(&rooms, Uuid::now_v7());
        let (_c, mut rx_c) = connect(&rooms, Uuid::now_v7());

        rooms.join(a, room);
        rooms.join(b, room);

        rooms.broadcast(room, &ServerEvent::UserOnline { user_id: Uuid::now_v7() });
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        // not joined, not addressed
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_actor() {
        let rooms = RoomRegistry::new();
        let room = RoomKey::Conversation(Uuid::now_v7());
        let (a, mut rx_a) = connect(&rooms, Uuid::now_v7());
        let (b, mut rx_b) = connect(&rooms, Uuid::now_v7());
        rooms.join(a, room);
        rooms.join(b, room);

        rooms.broadcast_except(room, a, &ServerEvent::UserOffline { user_id: Uuid::now_v7() });
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_reports_rooms_and_stops_delivery() {
        let rooms = RoomRegistry::new();
        let conversation = RoomKey::Conversation(Uuid::now_v7());
        let community = RoomKey::Community(Uuid::now_v7());
        let (a, mut rx_a) = connect(&rooms, Uuid::now_v7());
        rooms.join(a, conversation);
        rooms.join(a, community);
        assert!(rooms.has_joined(a, community));

        let left = rooms.unregister(a);
        assert_eq!(left.len(), 2);
        assert!(left.contains(&conversation));
        assert!(left.contains(&community));

        rooms.broadcast(community, &ServerEvent::UserOnline { user_id: Uuid::now_v7() });
        assert!(rx_a.try_recv().is_err());
        assert!(!rooms.has_joined(a, community));
    }

    #[tokio::test]
    async fn leave_only_affects_one_room() {
        let rooms = RoomRegistry::new();
        let conversation = RoomKey::Conversation(Uuid::now_v7());
        let community = RoomKey::Community(Uuid::now_v7());
        let (a, mut rx_a) = connect(&rooms, Uuid::now_v7());
        rooms.join(a, conversation);
        rooms.join(a, community);

        rooms.leave(a, conversation);
        assert!(!rooms.has_joined(a, conversation));
        assert!(rooms.has_joined(a, community));

        rooms.broadcast(community, &ServerEvent::UserOnline { user_id: Uuid::now_v7() });
        assert!(rx_a.try_recv().is_ok());
    }
}
