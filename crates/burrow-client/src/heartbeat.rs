//! Periodic heartbeat emission

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::connector::ServerConnector;
use crate::fault::{Fault, FaultSignal};

/// Send a heartbeat every `interval` until the session ends. A failed
/// heartbeat raises a fault and stops the emitter.
pub async fn run_heartbeat(
    connector: ServerConnector,
    client_id: u16,
    interval: Duration,
    generation: Uuid,
    fault: FaultSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = fault.token().cancelled() => break,
            _ = ticker.tick() => {
                match connector.heartbeat(client_id).await {
                    Ok(()) => trace!(client_id, "Heartbeat acked"),
                    Err(e) => {
                        fault.raise(generation, Fault::Heartbeat(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    debug!(client_id, "Heartbeat emitter stopped");
}
