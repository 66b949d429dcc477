use burrow_auth::AuthError;
use burrow_proto::ProtoError;
use thiserror::Error;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("No free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Timed out waiting for the control request")]
    RequestTimeout,
}
