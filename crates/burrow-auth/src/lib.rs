//! Identity for burrow clients
//!
//! The tunnel core only needs two things from here: a way for a client to obtain
//! a token ([`Authenticator`]) and a way for the server to turn a token back into
//! a numeric client id ([`ClientResolver`]). Tokens are HS256 JWTs whose `sub`
//! is the key of a [`UserRecord`] in a [`UserStore`].

pub mod authenticator;
pub mod error;
pub mod jwt;
pub mod password;
pub mod resolver;
pub mod store;

pub use authenticator::{Authenticator, LocalAuthenticator, LoginResponse};
pub use error::AuthError;
pub use jwt::{JwtClaims, JwtError, JwtValidator, DEFAULT_TOKEN_VALIDITY_DAYS};
pub use password::{hash_password, verify_password, PasswordError};
pub use resolver::{ClientResolver, StoreResolver};
pub use store::{FileUserStore, MemoryUserStore, UserRecord, UserStore};

// Re-export useful types
pub use async_trait::async_trait;
