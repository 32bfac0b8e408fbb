//! Wire protocol: every frame is `{"event": <name>, "data": {…}}`. Direct
//! messaging uses snake_case names, communities a dashed namespace, so the
//! two protocols can never collide on an event name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{CommunityMessage, DirectMessage, Role};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConversation { conversation_id: Uuid },
    LeaveConversation { conversation_id: Uuid },
    SendMessage { conversation_id: Uuid, text: String },
    Typing { conversation_id: Uuid },
    StopTyping { conversation_id: Uuid },
    MarkAsRead { conversation_id: Uuid },

    #[serde(rename = "join-community")]
    JoinCommunity { community_id: Uuid },
    #[serde(rename = "leave-community")]
    LeaveCommunity { community_id: Uuid },
    #[serde(rename = "send-community-message")]
    SendCommunityMessage { community_id: Uuid, text: String },
    #[serde(rename = "community-typing")]
    CommunityTyping { community_id: Uuid },
    #[serde(rename = "community-stop-typing")]
    CommunityStopTyping { community_id: Uuid },
    #[serde(rename = "get-community-messages")]
    GetCommunityMessages {
        community_id: Uuid,
        limit: Option<i64>,
        before_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinedConversation { conversation_id: Uuid },
    LeftConversation { conversation_id: Uuid, user_id: Uuid },
    NewMessage { message: DirectMessage },
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        message_ids: Vec<Uuid>,
    },
    UnreadCount { conversation_id: Uuid, count: i64 },
    /// Personal-channel delivery: reaches the receiver even when they are
    /// not viewing the conversation, carrying a freshly computed count.
    MessageNotification {
        conversation_id: Uuid,
        message: DirectMessage,
        unread_count: i64,
    },
    Typing { conversation_id: Uuid, user_id: Uuid },
    StoppedTyping { conversation_id: Uuid, user_id: Uuid },
    UserOnline { user_id: Uuid },
    UserOffline { user_id: Uuid },

    #[serde(rename = "joined-community")]
    JoinedCommunity { community_id: Uuid },
    #[serde(rename = "user-joined")]
    UserJoined {
        community_id: Uuid,
        username: String,
        role: Role,
    },
    #[serde(rename = "user-left")]
    UserLeft {
        community_id: Uuid,
        username: String,
        role: Role,
    },
    #[serde(rename = "community-message")]
    CommunityMessage {
        community_id: Uuid,
        message: CommunityMessagePayload,
    },
    #[serde(rename = "community-typing")]
    CommunityTyping {
        community_id: Uuid,
        username: String,
        role: Role,
    },
    #[serde(rename = "community-stop-typing")]
    CommunityStoppedTyping {
        community_id: Uuid,
        username: String,
        role: Role,
    },
    #[serde(rename = "community-messages")]
    CommunityMessages {
        community_id: Uuid,
        messages: Vec<CommunityMessagePayload>,
    },

    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }
}

/// A community message as broadcast to the room. Students are only ever
/// represented by their anonymous handle; the stored sender id never goes
/// out on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct CommunityMessagePayload {
    pub id: Uuid,
    pub community_id: Uuid,
    pub sender_role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_username: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl CommunityMessagePayload {
    /// `display_name` comes from the store's display resolution at broadcast
    /// time, so a rename shows up on old messages too.
    pub fn from_message(message: &CommunityMessage, display_name: String) -> Self {
        let (username, anonymous_username) = match message.sender_role {
            Role::Student => (None, Some(display_name)),
            _ => (Some(display_name), None),
        };
        Self {
            id: message.id,
            community_id: message.community_id,
            sender_role: message.sender_role,
            username,
            anonymous_username,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_events_use_snake_case_names() {
        let parsed: ClientEvent = serde_json::from_str(
            r#"{"event":"join_conversation","data":{"conversation_id":"0195c2f0-0000-7000-8000-000000000001"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed, ClientEvent::JoinConversation { .. }));

        let frame = serde_json::to_value(ServerEvent::MessagesRead {
            conversation_id: Uuid::now_v7(),
            reader_id: Uuid::now_v7(),
            message_ids: vec![],
        })
        .unwrap();
        assert_eq!(frame["event"], "messages_read");
    }

    #[test]
    fn community_events_use_the_dashed_namespace() {
        let parsed: ClientEvent = serde_json::from_str(
            r#"{"event":"send-community-message","data":{"community_id":"0195c2f0-0000-7000-8000-000000000002","text":"hello"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed, ClientEvent::SendCommunityMessage { .. }));

        let frame = serde_json::to_value(ServerEvent::UserJoined {
            community_id: Uuid::now_v7(),
            username: "anonymous".to_owned(),
            role: Role::Student,
        })
        .unwrap();
        assert_eq!(frame["event"], "user-joined");
        assert_eq!(frame["data"]["username"], "anonymous");
    }

    #[test]
    fn student_payload_carries_only_the_anonymous_handle() {
        let message = CommunityMessage {
            id: Uuid::now_v7(),
            community_id: Uuid::now_v7(),
            sender_id: Uuid::now_v7(),
            sender_role: Role::Student,
            content: "feeling better this week".to_owned(),
            created_at: Utc::now(),
        };
        let payload = CommunityMessagePayload::from_message(&message, "QuickFox_1a2b".to_owned());
        let json = serde_json::to_string(&payload).unwrap();

        // the stored sender id never appears on the wire
        assert!(!json.contains(&message.sender_id.to_string()));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["anonymous_username"], "QuickFox_1a2b");
        assert!(value.get("username").is_none());
    }

    #[test]
    fn staff_payload_shows_the_real_name() {
        let message = CommunityMessage {
            id: Uuid::now_v7(),
            community_id: Uuid::now_v7(),
            sender_id: Uuid::now_v7(),
            sender_role: Role::Counsellor,
            content: "session slots open friday".to_owned(),
            created_at: Utc::now(),
        };
        let payload = CommunityMessagePayload::from_message(&message, "Dr. Okafor".to_owned());
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["username"], "Dr. Okafor");
        assert!(value.get("anonymous_username").is_none());
    }
}
