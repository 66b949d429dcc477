use thiserror::Error;

use crate::jwt::JwtError;
use crate::password::PasswordError;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Anonymous login is disabled on this server")]
    AnonymousDisabled,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("No user owns this token")]
    UserNotFound,

    #[error("User {0} is banned")]
    UserBanned(u16),

    #[error("User name already taken: {0}")]
    UserExists(String),

    #[error("No client ids left to assign")]
    IdsExhausted,

    #[error("User store error: {0}")]
    Storage(String),

    #[error("Password error: {0}")]
    Password(#[from] PasswordError),

    /// The remote login endpoint could not be reached or answered garbage.
    #[error("Login transport error: {0}")]
    Transport(String),

    /// The remote login endpoint answered with a failure status.
    #[error("Login rejected: {0}")]
    Rejected(String),
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            other => AuthError::InvalidToken(other.to_string()),
        }
    }
}
