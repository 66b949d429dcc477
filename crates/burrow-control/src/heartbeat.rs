//! Periodic eviction of silent clients

use std::sync::Arc;
use std::time::Duration;

use burrow_proto::DEFAULT_HEARTBEAT_TIMEOUT_SECS;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Default sweep period
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    check_interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start one independent eviction per stale client and return their ids.
    pub fn sweep(&self) -> Vec<u16> {
        let stale = self.registry.stale_clients(self.timeout);
        for &client_id in &stale {
            let registry = self.registry.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                if registry.evict_if_stale(client_id, timeout) {
                    info!(client_id, "Evicted client after heartbeat timeout");
                }
            });
        }
        stale
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        debug!(
            interval = ?self.check_interval,
            timeout = ?self.timeout,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stale = self.sweep();
                    if !stale.is_empty() {
                        debug!(count = stale.len(), "Heartbeat sweep found stale clients");
                    }
                }
            }
        }

        debug!("Heartbeat monitor stopped");
    }
}
