//! Signed client tokens

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long an issued client token stays valid
pub const DEFAULT_TOKEN_VALIDITY_DAYS: i64 = 30;

const ISSUER: &str = "burrow";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// User key, the lookup handle into the user store
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    /// Client id at issue time. Informational; the store stays authoritative.
    pub uid: u16,
}

impl JwtClaims {
    pub fn new(user_key: String, client_id: u16, validity: Duration) -> Self {
        let issued = Utc::now();
        Self {
            sub: user_key,
            iat: issued.timestamp(),
            exp: (issued + validity).timestamp(),
            iss: ISSUER.to_string(),
            uid: client_id,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("could not sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("bad token: {0}")]
    InvalidToken(String),
}

/// HS256 signer and checker sharing one secret.
///
/// Only signature, issuer and expiry are checked; there is no audience.
pub struct JwtValidator {
    signing: EncodingKey,
    checking: DecodingKey,
    rules: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut rules = Validation::new(Algorithm::HS256);
        rules.leeway = 0;
        rules.validate_aud = false;
        rules.set_issuer(&[ISSUER]);
        rules.set_required_spec_claims(&["exp", "sub", "iss"]);

        Self {
            signing: EncodingKey::from_secret(secret),
            checking: DecodingKey::from_secret(secret),
            rules,
        }
    }

    pub fn issue(&self, claims: &JwtClaims) -> Result<String, JwtError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.signing)
            .map_err(JwtError::Signing)
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let claims = jsonwebtoken::decode::<JwtClaims>(token, &self.checking, &self.rules)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                _ => JwtError::InvalidToken(e.to_string()),
            })?;

        // jsonwebtoken accepts exp == now; a zero-validity token is already dead
        if claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let validator = JwtValidator::new(b"secret");
        let claims = JwtClaims::new(
            "user-key".to_string(),
            7,
            Duration::days(DEFAULT_TOKEN_VALIDITY_DAYS),
        );
        let token = validator.issue(&claims).unwrap();

        let decoded = validator.validate(&token).unwrap();
        assert_eq!(decoded.sub, "user-key");
        assert_eq!(decoded.uid, 7);
        assert_eq!(decoded.iss, "burrow");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = JwtClaims::new("k".to_string(), 1, Duration::hours(1));
        let token = JwtValidator::new(b"one").issue(&claims).unwrap();

        let result = JwtValidator::new(b"two").validate(&token);
        assert!(matches!(result, Err(JwtError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = JwtValidator::new(b"secret");
        let claims = JwtClaims::new("k".to_string(), 1, Duration::hours(-1));
        assert!(claims.is_expired());
        let token = validator.issue(&claims).unwrap();

        assert!(matches!(
            validator.validate(&token),
            Err(JwtError::TokenExpired)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let validator = JwtValidator::new(b"secret");
        assert!(matches!(
            validator.validate("notoken"),
            Err(JwtError::InvalidToken(_))
        ));
    }
}
