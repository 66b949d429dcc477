use burrow_control::PoolError;
use burrow_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Reverse connection names unknown client {0}")]
    UnknownClient(u16),

    #[error("Client {client_id} has no app {app_id}")]
    UnknownApp { client_id: u16, app_id: u8 },

    #[error("Reverse connection did not identify itself in time")]
    HelloTimeout,

    #[error("Tunnel cancelled before it was established")]
    Cancelled,

    #[error("Consumer hung up before a reverse connection was available")]
    ConsumerGone,
}
