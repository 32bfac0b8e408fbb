use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::{distr::Alphanumeric, Rng};
use uuid::Uuid;

use crate::{error::WsError, store::{ChatStore, Role}};

/// Verified identity attached to a socket connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: Uuid,
    pub role: Role,
    pub tenant_id: Uuid,
}

struct IssuedToken {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Bridges a cookie-held HTTP session into socket identity. The transport's
/// handshake cannot read HTTP-only cookies, so an authenticated endpoint
/// mints a short-lived capability token the client presents at connect time.
///
/// Tokens are single use and never refreshed in-socket: an expired token
/// fails closed and the client reconnects through the HTTP flow.
#[derive(Clone)]
pub struct SessionBridge {
    tokens: Arc<DashMap<String, IssuedToken>>,
    ttl: Duration,
}

impl SessionBridge {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(60))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn issue(&self, user_id: Uuid) -> String {
        let now = Utc::now();
        self.tokens.retain(|_, issued| issued.expires_at > now);

        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        self.tokens.insert(
            token.clone(),
            IssuedToken { user_id, expires_at: now + self.ttl },
        );
        token
    }

    /// Consumes the token and re-derives role and tenant from the user store.
    /// Client-declared hints play no part in any authorization decision here.
    pub async fn authenticate(
        &self,
        store: &dyn ChatStore,
        token: &str,
    ) -> Result<Identity, WsError> {
        let (_, issued) = self
            .tokens
            .remove(token)
            .ok_or_else(|| WsError::AuthenticationRejected("unknown socket token".to_owned()))?;
        if issued.expires_at <= Utc::now() {
            return Err(WsError::AuthenticationRejected("socket token expired".to_owned()));
        }

        let user = store
            .get_user(issued.user_id)
            .await?
            .ok_or_else(|| WsError::AuthenticationRejected("unknown user".to_owned()))?;
        Ok(Identity {
            id: user.id,
            role: user.role,
            tenant_id: user.tenant_id,
        })
    }
}

impl Default for SessionBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{MockChatStore, UserRecord};

    use super::*;

    fn mock_user(id: Uuid, role: Role, tenant_id: Uuid) -> UserRecord {
        UserRecord {
            id,
            name: "Jordan Li".to_owned(),
            role,
            tenant_id,
            anon_handle: "QuickFox_1a2b".to_owned(),
        }
    }

    #[tokio::test]
    async fn identity_is_rederived_from_the_store() {
        let bridge = SessionBridge::new();
        let user_id = Uuid::now_v7();
        let tenant_id = Uuid::now_v7();

        let mut store = MockChatStore::new();
        store
            .expect_get_user()
            .returning(move |_| Ok(Some(mock_user(user_id, Role::Counsellor, tenant_id))));

        let token = bridge.issue(user_id);
        let identity = bridge.authenticate(&store, &token).await.unwrap();
        assert_eq!(identity.id, user_id);
        assert_eq!(identity.role, Role::Counsellor);
        assert_eq!(identity.tenant_id, tenant_id);
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let bridge = SessionBridge::new();
        let user_id = Uuid::now_v7();
        let tenant_id = Uuid::now_v7();

        let mut store = MockChatStore::new();
        store
            .expect_get_user()
            .returning(move |_| Ok(Some(mock_user(user_id, Role::Student, tenant_id))));

        let token = bridge.issue(user_id);
        assert!(bridge.authenticate(&store, &token).await.is_ok());

        let second = bridge.authenticate(&store, &token).await;
        assert!(matches!(second, Err(WsError::AuthenticationRejected(_))));
    }

    #[tokio::test]
    async fn expired_tokens_fail_closed() {
        let bridge = SessionBridge::with_ttl(Duration::seconds(-1));
        let store = MockChatStore::new();

        let token = bridge.issue(Uuid::now_v7());
        let result = bridge.authenticate(&store, &token).await;
        assert!(matches!(result, Err(WsError::AuthenticationRejected(_))));
    }

    #[tokio::test]
    async fn unknown_tokens_are_rejected() {
        let bridge = SessionBridge::new();
        let store = MockChatStore::new();
        let result = bridge.authenticate(&store, "tok_forged").await;
        assert!(matches!(result, Err(WsError::AuthenticationRejected(_))));
    }
}
