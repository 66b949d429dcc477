//! Token to client-id resolution used by the control channel

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use burrow_proto::NO_TOKEN;
use tracing::debug;

use crate::error::AuthError;
use crate::jwt::JwtValidator;
use crate::store::UserStore;

/// Maps a presented token to the numeric client id it belongs to
#[async_trait]
pub trait ClientResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<u16, AuthError>;
}

/// Checks the JWT, then the user store, then the ban list
pub struct StoreResolver {
    store: Arc<dyn UserStore>,
    jwt: Arc<JwtValidator>,
    banned: RwLock<HashSet<u16>>,
}

impl StoreResolver {
    pub fn new(store: Arc<dyn UserStore>, jwt: Arc<JwtValidator>) -> Self {
        Self {
            store,
            jwt,
            banned: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_banlist(self, ids: impl IntoIterator<Item = u16>) -> Self {
        if let Ok(mut banned) = self.banned.write() {
            banned.extend(ids);
        }
        self
    }

    pub fn ban(&self, client_id: u16) {
        if let Ok(mut banned) = self.banned.write() {
            banned.insert(client_id);
        }
    }

    pub fn unban(&self, client_id: u16) {
        if let Ok(mut banned) = self.banned.write() {
            banned.remove(&client_id);
        }
    }

    fn is_banned(&self, client_id: u16) -> bool {
        self.banned
            .read()
            .map(|b| b.contains(&client_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClientResolver for StoreResolver {
    async fn resolve(&self, token: &str) -> Result<u16, AuthError> {
        if token.is_empty() || token == NO_TOKEN {
            return Err(AuthError::InvalidToken("no token presented".to_string()));
        }

        let claims = self.jwt.validate(token)?;
        let record = self
            .store
            .find_by_key(&claims.sub)
            .await
            .ok_or(AuthError::UserNotFound)?;

        if self.is_banned(record.user_id) {
            debug!(client_id = record.user_id, "Rejected banned user");
            return Err(AuthError::UserBanned(record.user_id));
        }

        Ok(record.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::{Authenticator, LocalAuthenticator};
    use crate::store::MemoryUserStore;

    async fn setup() -> (StoreResolver, LocalAuthenticator, Arc<MemoryUserStore>) {
        let store = Arc::new(MemoryUserStore::new());
        let jwt = Arc::new(JwtValidator::new(b"resolver-secret"));
        let auth = LocalAuthenticator::new(store.clone(), jwt.clone()).with_anonymous(true);
        (StoreResolver::new(store.clone(), jwt), auth, store)
    }

    #[tokio::test]
    async fn test_resolves_issued_token() {
        let (resolver, auth, _) = setup().await;
        let login = auth.login("", "").await.unwrap();
        assert_eq!(resolver.resolve(&login.token).await.unwrap(), login.user_id);
    }

    #[tokio::test]
    async fn test_no_token_rejected() {
        let (resolver, _, _) = setup().await;
        assert!(matches!(
            resolver.resolve(NO_TOKEN).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(resolver.resolve("").await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_user_rejected() {
        let (resolver, auth, store) = setup().await;
        let login = auth.login("", "").await.unwrap();
        let key = resolver.jwt.validate(&login.token).unwrap().sub;
        store.remove(&key).await;

        assert!(matches!(
            resolver.resolve(&login.token).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_banlist() {
        let (resolver, auth, _) = setup().await;
        let login = auth.login("", "").await.unwrap();

        resolver.ban(login.user_id);
        assert!(matches!(
            resolver.resolve(&login.token).await,
            Err(AuthError::UserBanned(id)) if id == login.user_id
        ));

        resolver.unban(login.user_id);
        assert!(resolver.resolve(&login.token).await.is_ok());
    }
}
