//! Protocol message types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The peer closed the stream before a complete frame arrived.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(std::io::Error),

    #[error("Unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Unknown tunnel signal: 0x{0:02x}")]
    UnknownSignal(u8),

    #[error("Unexpected heartbeat ack byte: 0x{0:02x}")]
    UnexpectedAck(u8),

    #[error("Field {field} too large: {len} exceeds {max}")]
    FieldTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Token is not valid UTF-8")]
    InvalidToken,
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtoError::ConnectionClosed,
            _ => ProtoError::IoError(e),
        }
    }
}

impl ProtoError {
    /// True when the error only means the peer went away.
    pub fn is_closed(&self) -> bool {
        match self {
            ProtoError::ConnectionClosed => true,
            ProtoError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// First byte of every control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    NewAppRequest = 0x01,
    Heartbeat = 0x02,
    CloseClient = 0x03,
    /// Same payload and handling as `NewAppRequest`; prior state is always discarded.
    Reconnect = 0x04,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::NewAppRequest),
            0x02 => Ok(Opcode::Heartbeat),
            0x03 => Ok(Opcode::CloseClient),
            0x04 => Ok(Opcode::Reconnect),
            other => Err(ProtoError::UnknownOpcode(other)),
        }
    }
}

/// App registration payload shared by `NewAppRequest` and `Reconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppRequest {
    pub token: String,
    /// One entry per app, in app order. `0` lets the server choose the port.
    pub port_hints: Vec<u16>,
}

impl NewAppRequest {
    pub fn new(token: impl Into<String>, port_hints: Vec<u16>) -> Self {
        Self {
            token: token.into(),
            port_hints,
        }
    }
}

/// A decoded control-channel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    NewApp {
        /// Set when the client sent `Reconnect` instead of `NewAppRequest`.
        reconnect: bool,
        request: NewAppRequest,
    },
    Heartbeat {
        client_id: u16,
    },
    CloseClient {
        client_id: u16,
    },
}

impl ControlRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlRequest::NewApp {
                reconnect: false, ..
            } => Opcode::NewAppRequest,
            ControlRequest::NewApp {
                reconnect: true, ..
            } => Opcode::Reconnect,
            ControlRequest::Heartbeat { .. } => Opcode::Heartbeat,
            ControlRequest::CloseClient { .. } => Opcode::CloseClient,
        }
    }
}

/// One allocated app as reported back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppAssignment {
    pub app_id: u8,
    pub port: u16,
}

/// Server reply to `NewAppRequest` / `Reconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppResponse {
    pub client_id: u16,
    /// Same order as the request's port hints.
    pub assignments: Vec<AppAssignment>,
}

/// First bytes on every reverse connection: which session and app it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderHello {
    pub client_id: u16,
    pub app_id: u8,
}

impl ProviderHello {
    pub const LEN: usize = 3;

    pub fn new(client_id: u16, app_id: u8) -> Self {
        Self { client_id, app_id }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let id = self.client_id.to_be_bytes();
        [id[0], id[1], self.app_id]
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self {
            client_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            app_id: bytes[2],
        }
    }
}

/// Signal carried by a pooled reverse connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelSignal {
    /// A consumer arrived; start relaying.
    Open,
    /// The server tore the tunnel down (explicit `0x00` or EOF).
    Close,
}

impl TunnelSignal {
    pub const OPEN: u8 = 0x01;
    pub const CLOSE: u8 = 0x00;

    pub fn as_byte(self) -> u8 {
        match self {
            TunnelSignal::Open => Self::OPEN,
            TunnelSignal::Close => Self::CLOSE,
        }
    }
}

impl TryFrom<u8> for TunnelSignal {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::OPEN => Ok(TunnelSignal::Open),
            Self::CLOSE => Ok(TunnelSignal::Close),
            other => Err(ProtoError::UnknownSignal(other)),
        }
    }
}
