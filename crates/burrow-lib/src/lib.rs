//! Burrow server as a library
//!
//! ```ignore
//! use burrow_lib::{ServerConfig, TunnelServer};
//!
//! # async fn example() -> Result<(), burrow_lib::ServerError> {
//! let config = ServerConfig::default()
//!     .with_web_port(12309)
//!     .with_anonymous_login(true)
//!     .with_jwt_secret("change-me");
//!
//! let server = TunnelServer::bind(config).await?;
//! let handle = server.handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     handle.shutdown();
//! });
//! server.run().await
//! # }
//! ```

pub mod config;
mod error;
mod server;

pub use config::{PortRange, ServerConfig, UserSeed};
pub use error::ServerError;
pub use server::{ServerAddrs, ServerHandle, TunnelServer};

pub use burrow_auth as auth;
pub use burrow_control as control;
pub use burrow_proto as proto;
