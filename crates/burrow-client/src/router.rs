//! Client reconnect loop
//!
//! `LoggingIn -> Configuring -> Connected -> Closing`, then either stop or
//! start over from `LoggingIn` after the reconnect interval. A failure before
//! the first successful `Connected` ends the loop for good, since a client that
//! never worked is misconfigured rather than disconnected.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use burrow_auth::{Authenticator, LoginResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::cache::TokenCache;
use crate::config::ClientConfig;
use crate::connector::ServerConnector;
use crate::error::ClientError;
use crate::fault::{Fault, FaultSignal};
use crate::login::HttpAuthenticator;
use crate::session::Session;
use burrow_connection::{Role, RuntimeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterState {
    LoggingIn = 0,
    Configuring = 1,
    Connected = 2,
    Closing = 3,
}

impl RouterState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RouterState::Configuring,
            2 => RouterState::Connected,
            3 => RouterState::Closing,
            _ => RouterState::LoggingIn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Stopped,
    Started,
    LoginError,
}

/// Delivered in order, at least once per transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ClientStatus,
    /// One line per app when `Started`, empty otherwise
    pub tunnels: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// Retry even if the very first attempt never connected.
    pub always_reconnect: bool,
    /// Return after the first session ends instead of restarting.
    pub single_shot: bool,
}

/// How one pass through the state machine ended
enum Pass {
    Faulted(Fault),
    Closed,
}

/// Stops a running [`Router`] from another task
#[derive(Clone)]
pub struct RouterHandle {
    cancel: CancellationToken,
    client_id: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    connector: ServerConnector,
}

impl RouterHandle {
    /// Stop the loop for good and tell the server we are leaving.
    pub async fn close(&self) {
        self.cancel.cancel();
        let client_id = self.client_id.swap(0, Ordering::SeqCst) as u16;
        if client_id != 0 {
            if let Err(e) = self.connector.close_client(client_id).await {
                debug!(client_id, "Close request not delivered: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Where the running router currently is in its state machine
    pub fn state(&self) -> RouterState {
        RouterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Client id of the live session, if any
    pub fn client_id(&self) -> Option<u16> {
        match self.client_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id as u16),
        }
    }
}

pub struct Router {
    config: ClientConfig,
    context: RuntimeContext,
    connector: ServerConnector,
    authenticator: Arc<dyn Authenticator>,
    cache: TokenCache,
    mode: RunMode,
    status: Option<mpsc::UnboundedSender<StatusEvent>>,
    cancel: CancellationToken,
    client_id: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
}

impl Router {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let authenticator = HttpAuthenticator::new(config.login_url(), config.connect_timeout)?;
        Ok(Self {
            connector: ServerConnector::from_config(&config),
            cache: TokenCache::new(&config.cache_path),
            context: RuntimeContext::new(Role::Client),
            authenticator: Arc::new(authenticator),
            mode: RunMode::default(),
            status: None,
            cancel: CancellationToken::new(),
            client_id: Arc::new(AtomicU32::new(0)),
            state: Arc::new(AtomicU8::new(RouterState::LoggingIn as u8)),
            config,
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Receive status transitions. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.status = Some(tx);
        rx
    }

    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            cancel: self.cancel.clone(),
            client_id: self.client_id.clone(),
            state: self.state.clone(),
            connector: self.connector.clone(),
        }
    }

    pub fn state(&self) -> RouterState {
        RouterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RouterState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run until closed, until a fault in single-shot mode, or until the first
    /// attempt fails without ever connecting.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let span = self.context.span().clone();
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<(), ClientError> {
        // Set once a pass reaches Connected; later passes register with Reconnect
        let mut had_session = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let generation = Uuid::new_v4();
            let pass = self.run_pass(generation, had_session).await;
            self.set_state(RouterState::Closing);
            self.client_id.store(0, Ordering::SeqCst);

            let fault = match pass {
                Ok(Pass::Closed) => {
                    self.emit(ClientStatus::Stopped, Vec::new());
                    info!("Client closed");
                    return Ok(());
                }
                Ok(Pass::Faulted(fault)) => {
                    had_session = true;
                    self.emit(ClientStatus::Stopped, Vec::new());
                    ClientError::Fault(fault)
                }
                Err(e) => {
                    if matches!(e, ClientError::Login(_)) {
                        self.emit(ClientStatus::LoginError, Vec::new());
                    }
                    self.emit(ClientStatus::Stopped, Vec::new());
                    if !had_session && !self.mode.always_reconnect {
                        error!("Client could not start: {}", e);
                        return Err(e);
                    }
                    e
                }
            };

            if self.mode.single_shot {
                return Err(fault);
            }

            warn!(
                "Session ended ({}), restarting in {:?}",
                fault, self.config.reconnect_interval
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn run_pass(&mut self, generation: Uuid, reconnect: bool) -> Result<Pass, ClientError> {
        self.set_state(RouterState::LoggingIn);
        let token = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Pass::Closed),
            token = self.identity() => token?,
        };

        self.set_state(RouterState::Configuring);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Pass::Closed),
            response = self.connector.request_apps(&token, self.config.port_hints(), reconnect) => response?,
        };

        let fault = FaultSignal::new(generation, &self.cancel);
        let session = Session::new(&self.config, &response, self.connector.clone(), fault)?;
        self.client_id
            .store(u32::from(session.client_id()), Ordering::SeqCst);
        self.set_state(RouterState::Connected);

        let lines: Vec<String> = session.tunnels().iter().map(|t| t.to_string()).collect();
        info!(
            client_id = session.client_id(),
            %generation,
            "Connected, {} tunnel(s)",
            lines.len()
        );
        for line in &lines {
            info!("  {}", line);
        }
        session.start();
        self.emit(ClientStatus::Started, lines);

        let outcome = session.fault().wait().await;
        session.close();
        Ok(match outcome {
            Some(fault) => Pass::Faulted(fault),
            None => Pass::Closed,
        })
    }

    /// Explicit login, then the cached token, then anonymous registration.
    async fn identity(&self) -> Result<String, ClientError> {
        if let Some(login) = &self.config.login {
            let response = self
                .authenticator
                .login(&login.username, &login.password)
                .await?;
            info!(user = %login.username, client_id = response.user_id, "Logged in");
            self.remember(&response).await;
            return Ok(response.token);
        }

        match self.cache.load().await {
            Ok(Some(cached)) => {
                debug!(client_id = cached.user_id, "Using cached token");
                return Ok(cached.token);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable token cache: {}", e),
        }

        let response = self.authenticator.login("", "").await?;
        info!(client_id = response.user_id, "Registered anonymously");
        self.remember(&response).await;
        Ok(response.token)
    }

    async fn remember(&self, response: &LoginResponse) {
        if let Err(e) = self.cache.store(&response.token, response.user_id).await {
            warn!(path = %self.cache.path().display(), "Could not cache token: {}", e);
        }
    }

    fn emit(&self, status: ClientStatus, tunnels: Vec<String>) {
        if let Some(tx) = &self.status {
            let _ = tx.send(StatusEvent { status, tunnels });
        }
    }
}
