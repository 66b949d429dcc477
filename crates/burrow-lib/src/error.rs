use std::net::SocketAddr;
use std::path::PathBuf;

use burrow_auth::AuthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Auth setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Token secret file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
}
