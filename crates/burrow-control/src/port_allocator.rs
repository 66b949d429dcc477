//! Public port allocation
//!
//! Allocating a port means binding its listener; the port is "ours" for exactly
//! as long as the returned [`TcpListener`] lives.

use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::ControlError;

#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Bind a public listener. `requested == 0` lets the allocator choose.
    async fn bind(&self, requested: u16) -> Result<TcpListener, ControlError>;
}

/// Binds on one interface, choosing from a range or from the OS
pub struct TcpPortAllocator {
    bind_ip: IpAddr,
    range: Option<RangeInclusive<u16>>,
    cursor: Mutex<u16>,
}

impl TcpPortAllocator {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            range: None,
            cursor: Mutex::new(0),
        }
    }

    /// Choose unrequested ports from `range` instead of the OS ephemeral range.
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = *range.start();
        }
        self.range = Some(range);
        self
    }

    async fn bind_from_range(&self, range: &RangeInclusive<u16>) -> Result<TcpListener, ControlError> {
        let span = (*range.end() as u32).saturating_sub(*range.start() as u32) + 1;
        for _ in 0..span {
            let port = self.next_in_range(range);
            if port == 0 {
                continue;
            }
            match TcpListener::bind(SocketAddr::new(self.bind_ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(_) => continue,
            }
        }
        Err(ControlError::PortsExhausted {
            start: *range.start(),
            end: *range.end(),
        })
    }

    fn next_in_range(&self, range: &RangeInclusive<u16>) -> u16 {
        let mut cursor = match self.cursor.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !range.contains(&*cursor) {
            *cursor = *range.start();
        }
        let port = *cursor;
        *cursor = if port >= *range.end() {
            *range.start()
        } else {
            port + 1
        };
        port
    }
}

#[async_trait]
impl PortAllocator for TcpPortAllocator {
    async fn bind(&self, requested: u16) -> Result<TcpListener, ControlError> {
        if requested != 0 {
            return bind_with_retry(SocketAddr::new(self.bind_ip, requested)).await;
        }
        match &self.range {
            Some(range) => self.bind_from_range(range).await,
            None => bind_with_retry(SocketAddr::new(self.bind_ip, 0)).await,
        }
    }
}

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bind, retrying `AddrInUse` a few times: a listener torn down by the
/// previous session of the same client may still hold the port.
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ControlError> {
    let mut attempt = 1;
    loop {
        let err = match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(port = addr.port(), attempt, "Public port bound after retry");
                }
                return Ok(listener);
            }
            Err(e) => e,
        };
        if err.kind() != std::io::ErrorKind::AddrInUse || attempt == BIND_ATTEMPTS {
            return Err(ControlError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: err.to_string(),
            });
        }
        warn!(port = addr.port(), attempt, "Public port busy, retrying");
        tokio::time::sleep(BIND_RETRY_DELAY).await;
        attempt += 1;
    }
}
