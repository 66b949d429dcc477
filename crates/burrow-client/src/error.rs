use burrow_auth::AuthError;
use burrow_connection::ConnectionError;
use burrow_proto::ProtoError;
use thiserror::Error;

use crate::fault::Fault;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Login failed: {0}")]
    Login(#[from] AuthError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Token cache error: {0}")]
    Cache(String),

    #[error("App registration failed: {0}")]
    Registration(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Session failed: {0}")]
    Fault(Fault),
}
