use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{seq::IndexedRandom, Rng};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;

use super::{
    ChatStore, Community, CommunityMessage, Conversation, ConversationSummary, DirectMessage, Role,
    UserRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    uuid        TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    role        TEXT NOT NULL,
    tenant_id   TEXT NOT NULL,
    anon_handle TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token   TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(uuid)
);

CREATE TABLE IF NOT EXISTS conversations (
    uuid            TEXT PRIMARY KEY,
    student_id      TEXT NOT NULL REFERENCES users(uuid),
    counsellor_id   TEXT NOT NULL REFERENCES users(uuid),
    tenant_id       TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_message_at TEXT,
    UNIQUE (student_id, counsellor_id)
);

CREATE TABLE IF NOT EXISTS messages (
    uuid            TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(uuid) ON DELETE CASCADE,
    sender_id       TEXT NOT NULL,
    receiver_id     TEXT NOT NULL,
    content         TEXT NOT NULL,
    is_read         INTEGER NOT NULL DEFAULT 0,
    read_at         TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages (receiver_id, is_read, conversation_id);

CREATE TABLE IF NOT EXISTS communities (
    uuid        TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    title       TEXT NOT NULL,
    description TEXT NOT NULL,
    created_by  TEXT NOT NULL REFERENCES users(uuid),
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS community_members (
    user_id      TEXT NOT NULL REFERENCES users(uuid),
    community_id TEXT NOT NULL REFERENCES communities(uuid) ON DELETE CASCADE,
    role         TEXT NOT NULL DEFAULT 'member',
    created_at   TEXT NOT NULL,
    UNIQUE (user_id, community_id)
);

CREATE TABLE IF NOT EXISTS community_messages (
    uuid         TEXT PRIMARY KEY,
    community_id TEXT NOT NULL REFERENCES communities(uuid) ON DELETE CASCADE,
    sender_id    TEXT NOT NULL REFERENCES users(uuid),
    sender_role  TEXT NOT NULL,
    content      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
"#;

const ADJECTIVES: &[&str] = &[
    "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
    "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy",
    "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Lucky",
];

const NOUNS: &[&str] = &[
    "Fox", "Bear", "Eagle", "Wolf", "Tiger", "Lion", "Owl", "Rabbit",
    "Falcon", "Hawk", "Panda", "Phoenix", "Griffin", "Turtle", "Dolphin",
    "Whale", "Elephant", "Giraffe", "Zebra", "Otter",
];

fn generate_anon_handle() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap();
    let noun = NOUNS.choose(&mut rng).unwrap();
    format!("{adjective}{noun}_{:04x}", rng.random_range(0u16..=0xffff))
}

fn uuid_col(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s}: {e}")))
}

type UserRow = (String, String, String, String, String);
type ConversationRow = (String, String, String, String, DateTime<Utc>, Option<DateTime<Utc>>);
type CommunityRow = (String, String, String, String, String, DateTime<Utc>);
type CommunityMessageRow = (String, String, String, String, String, DateTime<Utc>);

fn user_row((uuid, name, role, tenant_id, anon_handle): UserRow) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        id: uuid_col(&uuid)?,
        name,
        role: role.parse()?,
        tenant_id: uuid_col(&tenant_id)?,
        anon_handle,
    })
}

fn conversation_row(
    (uuid, student_id, counsellor_id, tenant_id, created_at, last_message_at): ConversationRow,
) -> Result<Conversation, StoreError> {
    Ok(Conversation {
        id: uuid_col(&uuid)?,
        student_id: uuid_col(&student_id)?,
        counsellor_id: uuid_col(&counsellor_id)?,
        tenant_id: uuid_col(&tenant_id)?,
        created_at,
        last_message_at,
    })
}

fn community_row(
    (uuid, tenant_id, title, description, created_by, created_at): CommunityRow,
) -> Result<Community, StoreError> {
    Ok(Community {
        id: uuid_col(&uuid)?,
        tenant_id: uuid_col(&tenant_id)?,
        title,
        description,
        created_by: uuid_col(&created_by)?,
        created_at,
    })
}

fn community_message_row(
    (uuid, community_id, sender_id, sender_role, content, created_at): CommunityMessageRow,
) -> Result<CommunityMessage, StoreError> {
    Ok(CommunityMessage {
        id: uuid_col(&uuid)?,
        community_id: uuid_col(&community_id)?,
        sender_id: uuid_col(&sender_id)?,
        sender_role: sender_role.parse()?,
        content,
        created_at,
    })
}

pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Provisioning is the platform's job; this exists for seeding and tests.
    pub async fn create_user(
        &self,
        name: &str,
        role: Role,
        tenant_id: Uuid,
    ) -> Result<UserRecord, StoreError> {
        let id = Uuid::now_v7();
        let anon_handle = generate_anon_handle();
        sqlx::query("INSERT INTO users (uuid,name,role,tenant_id,anon_handle) VALUES (?,?,?,?,?)")
            .bind(id.to_string())
            .bind(name)
            .bind(role.as_str())
            .bind(tenant_id.to_string())
            .bind(&anon_handle)
            .execute(&self.pool)
            .await?;
        Ok(UserRecord {
            id,
            name: name.to_owned(),
            role,
            tenant_id,
            anon_handle,
        })
    }

    pub async fn grant_access_token(&self, token: &str, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO auth_tokens (token,user_id) VALUES (?,?)")
            .bind(token)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_community(
        &self,
        tenant_id: Uuid,
        title: &str,
        description: &str,
        created_by: Uuid,
    ) -> Result<Community, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO communities (uuid,tenant_id,title,description,created_by,created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(title)
        .bind(description)
        .bind(created_by.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Community {
            id,
            tenant_id,
            title: title.to_owned(),
            description: description.to_owned(),
            created_by,
            created_at: now,
        })
    }

    pub async fn add_member(&self, user_id: Uuid, community_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO community_members (user_id,community_id,created_at) VALUES (?,?,?) \
             ON CONFLICT(user_id,community_id) DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(community_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, user_id: Uuid, community_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM community_members WHERE user_id=? AND community_id=?")
            .bind(user_id.to_string())
            .bind(community_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn user_for_access_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT u.uuid,u.name,u.role,u.tenant_id,u.anon_handle \
             FROM users u JOIN auth_tokens t ON t.user_id = u.uuid WHERE t.token=?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_row).transpose()
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT uuid,name,role,tenant_id,anon_handle FROM users WHERE uuid=?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(user_row).transpose()
    }

    async fn find_or_create_conversation(
        &self,
        student_id: Uuid,
        counsellor_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        sqlx::query(
            "INSERT INTO conversations (uuid,student_id,counsellor_id,tenant_id,created_at) \
             VALUES (?,?,?,?,?) ON CONFLICT(student_id,counsellor_id) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(student_id.to_string())
        .bind(counsellor_id.to_string())
        .bind(tenant_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let row: ConversationRow = sqlx::query_as(
            "SELECT uuid,student_id,counsellor_id,tenant_id,created_at,last_message_at \
             FROM conversations WHERE student_id=? AND counsellor_id=?",
        )
        .bind(student_id.to_string())
        .bind(counsellor_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        conversation_row(row)
    }

    async fn get_conversation(
        &self,
        id: Uuid,
        requester_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT uuid,student_id,counsellor_id,tenant_id,created_at,last_message_at \
             FROM conversations WHERE uuid=? AND (student_id=? OR counsellor_id=?)",
        )
        .bind(id.to_string())
        .bind(requester_id.to_string())
        .bind(requester_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(conversation_row).transpose()
    }

    async fn list_conversations_for(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows: Vec<(String, String, String, Option<String>, Option<DateTime<Utc>>, i64)> =
            sqlx::query_as(
                "SELECT c.uuid, c.student_id, c.counsellor_id, \
                        (SELECT m.content FROM messages m WHERE m.conversation_id=c.uuid \
                         ORDER BY m.created_at DESC LIMIT 1), \
                        c.last_message_at, \
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id=c.uuid \
                         AND m.receiver_id=? AND m.is_read=0) \
                 FROM conversations c \
                 WHERE (c.student_id=? OR c.counsellor_id=?) AND c.tenant_id=? \
                 ORDER BY c.last_message_at IS NULL, c.last_message_at DESC",
            )
            .bind(user_id.to_string())
            .bind(user_id.to_string())
            .bind(user_id.to_string())
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(uuid, student_id, counsellor_id, last_message, last_message_at, unread_count)| {
                Ok(ConversationSummary {
                    id: uuid_col(&uuid)?,
                    student_id: uuid_col(&student_id)?,
                    counsellor_id: uuid_col(&counsellor_id)?,
                    last_message,
                    last_message_at,
                    unread_count,
                })
            })
            .collect()
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        text: &str,
    ) -> Result<DirectMessage, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO messages (uuid,conversation_id,sender_id,receiver_id,content,is_read,created_at) \
             VALUES (?,?,?,?,?,0,?)",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(sender_id.to_string())
        .bind(receiver_id.to_string())
        .bind(text)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at=? WHERE uuid=?")
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(DirectMessage {
            id,
            conversation_id,
            sender_id,
            receiver_id,
            content: text.to_owned(),
            is_read: false,
            read_at: None,
            created_at: now,
        })
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE messages SET is_read=1, read_at=? \
             WHERE conversation_id=? AND receiver_id=? AND is_read=0 RETURNING uuid",
        )
        .bind(Utc::now())
        .bind(conversation_id.to_string())
        .bind(reader_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(uuid,)| uuid_col(uuid)).collect()
    }

    async fn unread_total(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE receiver_id=? AND is_read=0")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn unread_in_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE conversation_id=? AND receiver_id=? AND is_read=0",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_community(&self, id: Uuid) -> Result<Option<Community>, StoreError> {
        let row: Option<CommunityRow> = sqlx::query_as(
            "SELECT uuid,tenant_id,title,description,created_by,created_at FROM communities WHERE uuid=?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(community_row).transpose()
    }

    async fn is_member(&self, user_id: Uuid, community_id: Uuid) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM community_members WHERE user_id=? AND community_id=?")
                .bind(user_id.to_string())
                .bind(community_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn insert_community_message(
        &self,
        community_id: Uuid,
        sender_id: Uuid,
        sender_role: Role,
        text: &str,
    ) -> Result<CommunityMessage, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO community_messages (uuid,community_id,sender_id,sender_role,content,created_at) \
             VALUES (?,?,?,?,?,?)",
        )
        .bind(id.to_string())
        .bind(community_id.to_string())
        .bind(sender_id.to_string())
        .bind(sender_role.as_str())
        .bind(text)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(CommunityMessage {
            id,
            community_id,
            sender_id,
            sender_role,
            content: text.to_owned(),
            created_at: now,
        })
    }

    async fn list_community_messages(
        &self,
        community_id: Uuid,
        limit: i64,
        before_id: Option<Uuid>,
    ) -> Result<Vec<CommunityMessage>, StoreError> {
        let limit = limit.clamp(1, 100);
        // v7 ids sort by creation time, so the id doubles as the page cursor
        let rows: Vec<CommunityMessageRow> = match before_id {
            Some(before) => {
                sqlx::query_as(
                    "SELECT uuid,community_id,sender_id,sender_role,content,created_at \
                     FROM community_messages WHERE community_id=? AND uuid<? \
                     ORDER BY uuid DESC LIMIT ?",
                )
                .bind(community_id.to_string())
                .bind(before.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT uuid,community_id,sender_id,sender_role,content,created_at \
                     FROM community_messages WHERE community_id=? \
                     ORDER BY uuid DESC LIMIT ?",
                )
                .bind(community_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(community_message_row).collect()
    }

    async fn resolve_display_name(&self, user_id: Uuid, role: Role) -> Result<String, StoreError> {
        let (name, anon_handle): (String, String) =
            sqlx::query_as("SELECT name,anon_handle FROM users WHERE uuid=?")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(match role {
            Role::Student => anon_handle,
            _ => name,
        })
    }
}
