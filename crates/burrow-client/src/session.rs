//! One negotiated client session: warm pool, tunnel opening, heartbeat
//!
//! Every task spawned here selects on the session's fault token, so raising a
//! fault (or closing the session) stops all of them, including live relays.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use burrow_connection::{connect_with_timeout, relay};
use burrow_proto::{read_tunnel_signal, NewAppResponse, TunnelSignal};
use tokio::net::TcpStream;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connector::ServerConnector;
use crate::error::ClientError;
use crate::fault::{Fault, FaultSignal};
use crate::heartbeat::run_heartbeat;
use crate::pool::{PendingProviders, ProviderTicket};

/// A registered app as seen by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub app_id: u8,
    pub server: String,
    pub public_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl Tunnel {
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}:{} => {}:{}",
            self.app_id, self.server, self.public_port, self.target_host, self.target_port
        )
    }
}

struct Shared {
    generation: Uuid,
    client_id: u16,
    connector: ServerConnector,
    connect_timeout: Duration,
    targets: HashMap<u8, String>,
    pending: PendingProviders,
    fault: FaultSignal,
}

pub struct Session {
    shared: Arc<Shared>,
    tunnels: Vec<Tunnel>,
    heartbeat_interval: Duration,
}

impl Session {
    pub fn new(
        config: &ClientConfig,
        response: &NewAppResponse,
        connector: ServerConnector,
        fault: FaultSignal,
    ) -> Result<Self, ClientError> {
        let mut tunnels = Vec::with_capacity(response.assignments.len());
        for assignment in &response.assignments {
            let app = (assignment.app_id as usize)
                .checked_sub(1)
                .and_then(|i| config.apps.get(i))
                .ok_or_else(|| {
                    ClientError::Registration(format!(
                        "server assigned unknown app id {}",
                        assignment.app_id
                    ))
                })?;
            tunnels.push(Tunnel {
                app_id: assignment.app_id,
                server: config.server_address.clone(),
                public_port: assignment.port,
                target_host: app.target_host.clone(),
                target_port: app.target_port,
            });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                generation: fault.generation(),
                client_id: response.client_id,
                connector,
                connect_timeout: config.connect_timeout,
                targets: tunnels.iter().map(|t| (t.app_id, t.target())).collect(),
                pending: PendingProviders::new(),
                fault,
            }),
            tunnels,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    pub fn client_id(&self) -> u16 {
        self.shared.client_id
    }

    pub fn generation(&self) -> Uuid {
        self.shared.generation
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn fault(&self) -> &FaultSignal {
        &self.shared.fault
    }

    pub fn pending(&self, app_id: u8) -> usize {
        self.shared.pending.pending(app_id)
    }

    /// Open one warm reverse connection per app and start the heartbeat.
    pub fn start(&self) {
        for tunnel in &self.tunnels {
            let shared = self.shared.clone();
            let app_id = tunnel.app_id;
            tokio::spawn(
                async move {
                    replenish(shared, app_id).await;
                }
                .in_current_span(),
            );
        }

        tokio::spawn(
            run_heartbeat(
                self.shared.connector.clone(),
                self.shared.client_id,
                self.heartbeat_interval,
                self.shared.generation,
                self.shared.fault.clone(),
            )
            .in_current_span(),
        );
    }

    /// Stop every task and drop every socket of this session.
    pub fn close(&self) {
        self.shared.fault.token().cancel();
        self.shared.pending.clear();
        debug!(
            client_id = self.shared.client_id,
            generation = %self.shared.generation,
            "Session closed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.fault.token().cancel();
    }
}

/// Dial one reverse connection for `app_id` and wait on it. Returns false if
/// the session ended or the dial failed (which raises a fault).
async fn replenish(shared: Arc<Shared>, app_id: u8) -> bool {
    let opened = tokio::select! {
        _ = shared.fault.token().cancelled() => return false,
        opened = shared.connector.open_provider(shared.client_id, app_id) => opened,
    };
    match opened {
        Ok(stream) => {
            let ticket = shared.pending.track(app_id);
            tokio::spawn(serve_provider(shared, stream, ticket).in_current_span());
            true
        }
        Err(e) => {
            shared.fault.raise(
                shared.generation,
                Fault::ProviderFailed {
                    app_id,
                    reason: e.to_string(),
                },
            );
            false
        }
    }
}

/// Wait for the open signal on a pooled reverse connection, then bridge it to
/// the app's target.
fn serve_provider(
    shared: Arc<Shared>,
    mut provider: TcpStream,
    ticket: ProviderTicket,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let app_id = ticket.app_id;
        let generation = shared.generation;

        let signal = tokio::select! {
            _ = shared.fault.token().cancelled() => {
                shared.pending.forget(ticket);
                return;
            }
            signal = read_tunnel_signal(&mut provider) => signal,
        };

        match signal {
            Ok(TunnelSignal::Open) => {}
            Ok(TunnelSignal::Close) => {
                shared.pending.forget(ticket);
                shared
                    .fault
                    .raise(generation, Fault::ProviderClosed { app_id });
                return;
            }
            Err(e) => {
                shared.pending.forget(ticket);
                shared.fault.raise(
                    generation,
                    Fault::ProviderFailed {
                        app_id,
                        reason: e.to_string(),
                    },
                );
                return;
            }
        }

        if !shared.pending.take(ticket) {
            shared
                .fault
                .raise(generation, Fault::UntrackedProvider { app_id });
            return;
        }

        // Keep a spare in the server's pool before serving this consumer
        if !replenish(shared.clone(), app_id).await {
            return;
        }

        let Some(target) = shared.targets.get(&app_id).cloned() else {
            shared
                .fault
                .raise(generation, Fault::UntrackedProvider { app_id });
            return;
        };

        let dialed = tokio::select! {
            _ = shared.fault.token().cancelled() => return,
            dialed = connect_with_timeout(target.as_str(), shared.connect_timeout) => dialed,
        };
        let target_stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                shared.fault.raise(
                    generation,
                    Fault::TargetDial {
                        app_id,
                        target,
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };

        debug!(app_id, %target, "Tunnel opened");
        let outcome = relay(provider, target_stream, shared.fault.token()).await;
        info!(
            app_id,
            sent = outcome.left_to_right,
            received = outcome.right_to_left,
            end = ?outcome.end,
            "Tunnel closed"
        );
    })
}
