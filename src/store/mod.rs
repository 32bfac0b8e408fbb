//! The persistence collaborator. Everything durable lives behind [`ChatStore`];
//! the realtime core never caches rows across handler invocations.

mod models;
mod sqlite;

pub use models::{
    Community, CommunityMessage, Conversation, ConversationSummary, DirectMessage, Role, UserRecord,
};
pub use sqlite::SqliteChatStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Maps a hosted-auth access token to its user, if the token is live.
    async fn user_for_access_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, StoreError>;

    /// Idempotent get-or-create by the (student, counsellor) pair.
    async fn find_or_create_conversation(
        &self,
        student_id: Uuid,
        counsellor_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Conversation, StoreError>;

    /// Returns the conversation iff `requester_id` is a participant. Absent
    /// and forbidden are deliberately indistinguishable.
    async fn get_conversation(
        &self,
        id: Uuid,
        requester_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn list_conversations_for(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        text: &str,
    ) -> Result<DirectMessage, StoreError>;

    /// Marks every unread message addressed to `reader_id` in the
    /// conversation; returns the ids that changed.
    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid)
        -> Result<Vec<Uuid>, StoreError>;

    async fn unread_total(&self, user_id: Uuid) -> Result<i64, StoreError>;

    async fn unread_in_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StoreError>;

    async fn get_community(&self, id: Uuid) -> Result<Option<Community>, StoreError>;

    async fn is_member(&self, user_id: Uuid, community_id: Uuid) -> Result<bool, StoreError>;

    async fn insert_community_message(
        &self,
        community_id: Uuid,
        sender_id: Uuid,
        sender_role: Role,
        text: &str,
    ) -> Result<CommunityMessage, StoreError>;

    /// Reverse-chronological page; `before_id` is an exclusive cursor.
    async fn list_community_messages(
        &self,
        community_id: Uuid,
        limit: i64,
        before_id: Option<Uuid>,
    ) -> Result<Vec<CommunityMessage>, StoreError>;

    /// Anonymous handle for students, real name for everyone else.
    async fn resolve_display_name(&self, user_id: Uuid, role: Role) -> Result<String, StoreError>;
}
