use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::UserId, protocol::TokenPair};
use storage::ClientStore;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Identity of the authenticated viewer. Created after a successful
/// credential exchange and `users/im/` lookup; cleared on logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub authenticated: bool,
}

#[derive(Default)]
pub struct SessionStore {
    current: Mutex<Option<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn establish(&self, user_id: UserId, username: impl Into<String>) -> Session {
        let session = Session {
            user_id,
            username: username.into(),
            authenticated: true,
        };
        *self.current.lock().await = Some(session.clone());
        session
    }

    pub async fn clear(&self) {
        *self.current.lock().await = None;
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.current.lock().await.as_ref().map(|s| s.user_id)
    }
}

/// Where the credential pair survives between runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn store(&self, tokens: &TokenPair) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl CredentialStore for ClientStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.load_credentials().await?.map(|stored| TokenPair {
            access: stored.access,
            refresh: stored.refresh,
        }))
    }

    async fn store(&self, tokens: &TokenPair) -> Result<()> {
        self.store_credentials(&tokens.access, &tokens.refresh).await
    }

    async fn clear(&self) -> Result<()> {
        self.clear_credentials().await
    }
}

/// In-process credential store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<Option<TokenPair>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn store(&self, tokens: &TokenPair) -> Result<()> {
        *self.tokens.lock().await = Some(tokens.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.tokens.lock().await = None;
        Ok(())
    }
}

/// The single owner of the live credential pair, shared by the REST gateway
/// and the socket manager. Writes go through to the durable store; a persist
/// failure is logged and never fails the request that triggered it.
pub struct AuthTokens {
    tokens: RwLock<Option<TokenPair>>,
    persist: Arc<dyn CredentialStore>,
}

impl AuthTokens {
    pub fn new(persist: Arc<dyn CredentialStore>) -> Self {
        Self {
            tokens: RwLock::new(None),
            persist,
        }
    }

    /// Populates the in-memory pair from the durable store, if present.
    pub async fn hydrate(&self) -> Result<()> {
        let stored = self.persist.load().await?;
        *self.tokens.write().await = stored;
        Ok(())
    }

    pub async fn access(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.access.clone())
    }

    pub async fn refresh(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.refresh.clone())
    }

    pub async fn replace(&self, tokens: TokenPair) {
        if let Err(err) = self.persist.store(&tokens).await {
            warn!(%err, "failed to persist credentials");
        }
        *self.tokens.write().await = Some(tokens);
    }

    pub async fn update_access(&self, access: String) {
        let mut guard = self.tokens.write().await;
        let Some(pair) = guard.as_mut() else {
            return;
        };
        pair.access = access;
        let pair = pair.clone();
        drop(guard);
        if let Err(err) = self.persist.store(&pair).await {
            warn!(%err, "failed to persist refreshed access credential");
        }
    }

    pub async fn clear(&self) {
        *self.tokens.write().await = None;
        if let Err(err) = self.persist.clear().await {
            warn!(%err, "failed to clear persisted credentials");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn establish_and_clear_session() {
        let store = SessionStore::new();
        assert_eq!(store.current().await, None);

        let session = store.establish(UserId(3), "viewer").await;
        assert!(session.authenticated);
        assert_eq!(store.user_id().await, Some(UserId(3)));

        store.clear().await;
        assert_eq!(store.current().await, None);
    }

    #[tokio::test]
    async fn auth_tokens_write_through_and_clear() {
        let persist = Arc::new(MemoryCredentialStore::default());
        let tokens = AuthTokens::new(persist.clone());

        tokens
            .replace(TokenPair {
                access: "a1".into(),
                refresh: "r1".into(),
            })
            .await;
        assert_eq!(tokens.access().await.as_deref(), Some("a1"));
        assert!(persist.load().await.expect("load").is_some());

        tokens.update_access("a2".into()).await;
        assert_eq!(tokens.access().await.as_deref(), Some("a2"));
        assert_eq!(tokens.refresh().await.as_deref(), Some("r1"));
        assert_eq!(
            persist.load().await.expect("load").expect("pair").access,
            "a2"
        );

        tokens.clear().await;
        assert_eq!(tokens.access().await, None);
        assert_eq!(persist.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn hydrate_restores_persisted_pair() {
        let persist = Arc::new(MemoryCredentialStore::default());
        persist
            .store(&TokenPair {
                access: "a1".into(),
                refresh: "r1".into(),
            })
            .await
            .expect("seed");

        let tokens = AuthTokens::new(persist);
        tokens.hydrate().await.expect("hydrate");
        assert_eq!(tokens.access().await.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn update_access_without_a_pair_is_a_no_op() {
        let tokens = AuthTokens::new(Arc::new(MemoryCredentialStore::default()));
        tokens.update_access("a1".into()).await;
        assert_eq!(tokens.access().await, None);
    }
}
