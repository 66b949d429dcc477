//! Control-channel request handler
//!
//! Each control connection carries exactly one request. The handler reads it,
//! acts on it, writes the reply (if any) and returns; the caller drops the
//! connection. Any failure only affects this connection.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use burrow_auth::{AuthError, ClientResolver};
use burrow_proto::{
    read_control_request, write_heartbeat_ack, write_new_app_response, AppAssignment,
    ControlRequest, NewAppRequest, NewAppResponse,
};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::pool::{AppKey, AppPool};
use crate::port_allocator::PortAllocator;
use crate::registry::{AppBinding, ClientSession, SessionRegistry};

/// Default limit for a client to deliver its complete request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A bound public listener handed to the consumer side
pub struct AppListener {
    pub key: AppKey,
    pub listener: TcpListener,
    pub pool: Arc<AppPool>,
    /// Child of the owning session's token
    pub cancel: CancellationToken,
}

/// Callback that runs the accept loop for one app's public port.
///
/// Keeps this crate independent of the consumer-side implementation.
pub type ConsumerSpawner =
    Arc<dyn Fn(AppListener) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn ClientResolver>,
    port_allocator: Arc<dyn PortAllocator>,
    consumer_spawner: Option<ConsumerSpawner>,
    shutdown: CancellationToken,
    request_timeout: Duration,
    /// Serializes registrations of the same client id
    registering: DashMap<u16, Arc<tokio::sync::Mutex<()>>>,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn ClientResolver>,
        port_allocator: Arc<dyn PortAllocator>,
    ) -> Self {
        Self {
            registry,
            resolver,
            port_allocator,
            consumer_spawner: None,
            shutdown: CancellationToken::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            registering: DashMap::new(),
        }
    }

    pub fn with_consumer_spawner(mut self, spawner: ConsumerSpawner) -> Self {
        self.consumer_spawner = Some(spawner);
        self
    }

    /// Sessions are created as children of this token.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve one control connection.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = tokio::time::timeout(self.request_timeout, read_control_request(&mut stream))
            .await
            .map_err(|_| ControlError::RequestTimeout)??;

        debug!(%peer, opcode = ?request.opcode(), "Control request");

        match request {
            ControlRequest::NewApp { reconnect, request } => {
                let response = self.register_apps(request, reconnect).await?;
                write_new_app_response(&mut stream, &response).await?;
            }
            ControlRequest::Heartbeat { client_id } => {
                let acked = write_heartbeat_ack(&mut stream).await;
                if !self.registry.touch(client_id) {
                    debug!(client_id, "Heartbeat for unknown client ignored");
                }
                acked?;
            }
            ControlRequest::CloseClient { client_id } => {
                if self.registry.close_client(client_id) {
                    info!(client_id, "Client requested close");
                } else {
                    debug!(client_id, "Close for unknown client");
                }
            }
        }

        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Handle `NewAppRequest` / `Reconnect`: always a full re-registration.
    async fn register_apps(
        &self,
        request: NewAppRequest,
        reconnect: bool,
    ) -> Result<NewAppResponse, ControlError> {
        let client_id = match self.resolver.resolve(&request.token).await {
            Ok(0) => return Err(AuthError::InvalidToken("client id 0".to_string()).into()),
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected app registration: {}", e);
                return Err(e.into());
            }
        };

        let lock = self
            .registering
            .entry(client_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.registry.close_client(client_id) {
            info!(client_id, reconnect, "Discarded previous session before re-registration");
        }

        // Bind everything first; a failure drops the listeners bound so far
        let mut listeners = Vec::with_capacity(request.port_hints.len());
        for hint in &request.port_hints {
            listeners.push(self.port_allocator.bind(*hint).await?);
        }

        let mut apps = Vec::with_capacity(listeners.len());
        for (i, listener) in listeners.iter().enumerate() {
            apps.push(AppBinding {
                app_id: (i + 1) as u8,
                port: listener.local_addr()?.port(),
            });
        }

        let session = Arc::new(ClientSession::new(client_id, apps.clone(), &self.shutdown));
        let pools: Vec<Arc<AppPool>> = apps
            .iter()
            .map(|app| {
                self.registry.pool().register(
                    AppKey::new(client_id, app.app_id),
                    session.session_id(),
                    session.cancel_token().child_token(),
                )
            })
            .collect();
        self.registry.insert(session.clone());

        for (listener, pool) in listeners.into_iter().zip(pools) {
            let app = AppListener {
                key: pool.key(),
                listener,
                pool,
                cancel: session.cancel_token().child_token(),
            };
            match &self.consumer_spawner {
                Some(spawn) => {
                    tokio::spawn(spawn(app));
                }
                None => warn!(
                    client_id,
                    app_id = app.key.app_id,
                    "No consumer spawner configured, public port will not accept"
                ),
            }
        }

        for app in &apps {
            info!(client_id, app_id = app.app_id, port = app.port, "App registered");
        }

        Ok(NewAppResponse {
            client_id,
            assignments: apps
                .iter()
                .map(|a| AppAssignment {
                    app_id: a.app_id,
                    port: a.port,
                })
                .collect(),
        })
    }
}
