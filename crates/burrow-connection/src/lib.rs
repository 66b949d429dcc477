//! Stream plumbing shared by the burrow server and client
//!
//! - [`relay`]: pump bytes between two established streams until either side ends
//! - [`connect_with_timeout`]: bounded TCP dial
//! - [`RuntimeContext`]: per-process identity and tracing span handed to every component

pub mod context;
pub mod dial;
pub mod relay;

pub use context::{Role, RuntimeContext};
pub use dial::{connect_with_timeout, ConnectionError};
pub use relay::{relay, relay_with_buffer, RelayEnd, RelayOutcome, RELAY_BUFFER_SIZE};

pub use tokio_util::sync::CancellationToken;
