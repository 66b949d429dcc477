//! Burrow Protocol Definitions
//!
//! Byte layouts for the short-lived control channel (one opcode per connection),
//! the provider hello that opens every reverse connection, and the single-byte
//! tunnel signal the server sends over a pooled reverse connection.
//!
//! All multi-byte integers are big-endian. Every read is exact-length: a peer
//! that closes mid-frame surfaces as [`ProtoError::ConnectionClosed`].

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Token sent by a client that has no identity yet. The server never accepts it.
pub const NO_TOKEN: &str = "notoken";

/// The single byte the server answers a heartbeat with.
pub const HEARTBEAT_ACK: u8 = 0x01;

/// Default control-channel port
pub const DEFAULT_CONFIG_PORT: u16 = 12308;

/// Default port reverse (provider) connections dial into
pub const DEFAULT_PROVIDER_PORT: u16 = 19974;

/// Default port of the HTTP login endpoint
pub const DEFAULT_WEB_PORT: u16 = 12309;

/// Client heartbeat period in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Server eviction threshold in seconds (three missed heartbeats)
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Delay before the client restarts a broken session, in milliseconds
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;

/// Dial timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// How long to wait for a control-channel reply, in seconds
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;
