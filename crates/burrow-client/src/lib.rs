//! Burrow tunnel client
//!
//! The [`Router`] logs in, registers the configured apps, keeps one warm reverse
//! connection per app in the server's pool and restarts the whole session on
//! any fault.
//!
//! ```ignore
//! use burrow_client::{AppConfig, ClientConfig, Router};
//!
//! # async fn example() -> Result<(), burrow_client::ClientError> {
//! let config = ClientConfig::builder()
//!     .server("tunnel.example.com")
//!     .app(AppConfig::new("127.0.0.1", 5432))
//!     .build()?;
//!
//! let mut router = Router::new(config)?;
//! let mut status = router.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = status.recv().await {
//!         println!("{:?} {:?}", event.status, event.tunnels);
//!     }
//! });
//! router.run().await
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod connector;
mod error;
pub mod fault;
mod heartbeat;
pub mod login;
pub mod pool;
pub mod router;
pub mod session;

pub use cache::{CachedToken, TokenCache};
pub use config::{AppConfig, ClientConfig, ClientConfigBuilder, LoginInfo};
pub use connector::ServerConnector;
pub use error::ClientError;
pub use fault::{Fault, FaultSignal};
pub use login::HttpAuthenticator;
pub use pool::{PendingProviders, ProviderTicket};
pub use router::{ClientStatus, Router, RouterHandle, RouterState, RunMode, StatusEvent};
pub use session::{Session, Tunnel};
