//! Server-side tunnel control
//!
//! - [`ReversePool`]: idle reverse connections per app, race-free acquisition
//! - [`SessionRegistry`]: connected clients, their apps and last-seen times
//! - [`HeartbeatMonitor`]: evicts clients that stopped sending heartbeats
//! - [`ControlHandler`]: serves one control-channel request per connection
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod pool;
pub mod port_allocator;
pub mod registry;

pub use error::ControlError;
pub use handler::{AppListener, ConsumerSpawner, ControlHandler, DEFAULT_REQUEST_TIMEOUT};
pub use heartbeat::{HeartbeatMonitor, DEFAULT_CHECK_INTERVAL};
pub use pool::{AppKey, AppPool, PoolError, ReservedConnection, ReversePool};
pub use port_allocator::{bind_with_retry, PortAllocator, TcpPortAllocator};
pub use registry::{AppBinding, ClientSession, SessionRegistry};
