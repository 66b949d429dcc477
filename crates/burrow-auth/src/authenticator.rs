//! Login and anonymous registration

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AuthError;
use crate::jwt::{JwtClaims, JwtValidator, DEFAULT_TOKEN_VALIDITY_DAYS};
use crate::password::{hash_password, verify_password};
use crate::store::{UserRecord, UserStore};

/// Successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: u16,
}

/// Anything that can trade credentials for a token.
///
/// An empty username together with an empty password asks for anonymous
/// registration.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError>;
}

/// Issues tokens from a local [`UserStore`]
pub struct LocalAuthenticator {
    store: Arc<dyn UserStore>,
    jwt: Arc<JwtValidator>,
    allow_anonymous: bool,
    validity: Duration,
}

impl LocalAuthenticator {
    pub fn new(store: Arc<dyn UserStore>, jwt: Arc<JwtValidator>) -> Self {
        Self {
            store,
            jwt,
            allow_anonymous: false,
            validity: Duration::days(DEFAULT_TOKEN_VALIDITY_DAYS),
        }
    }

    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Register a named user up front (configuration seeding).
    ///
    /// A user already in a persistent store keeps its id; only a changed
    /// password is written back.
    pub async fn seed_user(&self, username: &str, password: &str) -> Result<UserRecord, AuthError> {
        if let Some(mut existing) = self.store.find_by_name(username).await {
            if !verify_password(password, &existing.password_hash).unwrap_or(false) {
                existing.password_hash = hash_password(password)?;
                self.store
                    .set_password(&existing.user_key, existing.password_hash.clone())
                    .await?;
                info!(user = %username, client_id = existing.user_id, "Updated seeded user password");
            }
            return Ok(existing);
        }
        let hash = hash_password(password)?;
        let record = self.store.create(username, hash, false).await?;
        info!(user = %username, client_id = record.user_id, "Seeded user");
        Ok(record)
    }

    fn issue(&self, record: &UserRecord) -> Result<LoginResponse, AuthError> {
        let claims = JwtClaims::new(record.user_key.clone(), record.user_id, self.validity);
        let token = self
            .jwt
            .issue(&claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(LoginResponse {
            token,
            user_id: record.user_id,
        })
    }

    async fn register_anonymous(&self) -> Result<LoginResponse, AuthError> {
        if !self.allow_anonymous {
            return Err(AuthError::AnonymousDisabled);
        }
        let name = format!("anon-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let record = self.store.create(&name, hash_password("")?, true).await?;
        info!(user = %name, client_id = record.user_id, "Registered anonymous user");
        self.issue(&record)
    }
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        if username.is_empty() && password.is_empty() {
            return self.register_anonymous().await;
        }

        let record = match self.store.find_by_name(username).await {
            Some(r) => r,
            None => {
                debug!(user = %username, "Login for unknown user");
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !verify_password(password, &record.password_hash)? {
            debug!(user = %username, "Login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        self.issue(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryUserStore;

    fn authenticator(anonymous: bool) -> (LocalAuthenticator, Arc<JwtValidator>) {
        let jwt = Arc::new(JwtValidator::new(b"test-secret"));
        let auth = LocalAuthenticator::new(Arc::new(MemoryUserStore::new()), jwt.clone())
            .with_anonymous(anonymous);
        (auth, jwt)
    }

    #[tokio::test]
    async fn test_login_seeded_user() {
        let (auth, jwt) = authenticator(false);
        let seeded = auth.seed_user("admin", "pw").await.unwrap();

        let resp = auth.login("admin", "pw").await.unwrap();
        assert_eq!(resp.user_id, seeded.user_id);

        let claims = jwt.validate(&resp.token).unwrap();
        assert_eq!(claims.sub, seeded.user_key);
    }

    #[tokio::test]
    async fn test_reseeding_keeps_id_and_applies_new_password() {
        let (auth, _) = authenticator(false);
        let first = auth.seed_user("admin", "pw").await.unwrap();
        let again = auth.seed_user("admin", "pw").await.unwrap();
        assert_eq!(again.user_id, first.user_id);

        let changed = auth.seed_user("admin", "rotated").await.unwrap();
        assert_eq!(changed.user_id, first.user_id);
        assert!(auth.login("admin", "rotated").await.is_ok());
        assert!(matches!(
            auth.login("admin", "pw").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user() {
        let (auth, _) = authenticator(false);
        auth.seed_user("admin", "pw").await.unwrap();

        assert!(matches!(
            auth.login("admin", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("ghost", "pw").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_anonymous_registration() {
        let (auth, _) = authenticator(true);
        let first = auth.login("", "").await.unwrap();
        let second = auth.login("", "").await.unwrap();
        assert_ne!(first.user_id, second.user_id);
        assert_ne!(first.token, second.token);
    }

    #[tokio::test]
    async fn test_anonymous_disabled() {
        let (auth, _) = authenticator(false);
        assert!(matches!(
            auth.login("", "").await,
            Err(AuthError::AnonymousDisabled)
        ));
    }
}
