//! TCP front ends of the burrow server
//!
//! - [`ControlServer`]: accepts control connections, one request each
//! - [`ProviderServer`]: accepts reverse connections and files them into app pools
//! - [`consumer`]: accept loop of one app's public port; pairs each consumer with a
//!   pooled reverse connection and relays between them

pub mod consumer;
mod control;
mod error;
mod provider;

pub use consumer::{consumer_spawner, handle_consumer, run_consumer_listener};
pub use control::ControlServer;
pub use error::TcpProxyError;
pub use provider::{ProviderServer, DEFAULT_HELLO_TIMEOUT};
