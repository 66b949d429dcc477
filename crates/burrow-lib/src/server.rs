//! Server orchestration: wire the components together, bind, run, shut down

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use burrow_api::ApiServer;
use burrow_auth::{
    FileUserStore, JwtValidator, LocalAuthenticator, MemoryUserStore, StoreResolver, UserStore,
};
use burrow_connection::{Role, RuntimeContext};
use burrow_control::{
    ControlHandler, HeartbeatMonitor, ReversePool, SessionRegistry, TcpPortAllocator,
};
use burrow_server_tcp::{consumer_spawner, ControlServer, ProviderServer};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Addresses actually bound (ports resolved when 0 was configured)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddrs {
    pub config: SocketAddr,
    pub provider: SocketAddr,
    pub web: Option<SocketAddr>,
}

/// Cloneable control surface of a running server
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    registry: Arc<SessionRegistry>,
    resolver: Arc<StoreResolver>,
}

impl ServerHandle {
    /// Stop accepting and tear down every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        debug!(closed, "Closed sessions on shutdown");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Refuse future registrations of `client_id` and drop its live session.
    pub fn ban(&self, client_id: u16) -> bool {
        self.resolver.ban(client_id);
        self.registry.close_client(client_id)
    }

    pub fn unban(&self, client_id: u16) {
        self.resolver.unban(client_id);
    }
}

struct Listeners {
    control: TcpListener,
    provider: TcpListener,
    web: Option<TcpListener>,
}

/// A bound burrow server
pub struct TunnelServer {
    config: ServerConfig,
    context: RuntimeContext,
    addrs: ServerAddrs,
    listeners: Listeners,
    handler: Arc<ControlHandler>,
    authenticator: Arc<LocalAuthenticator>,
    handle: ServerHandle,
}

impl TunnelServer {
    /// Build every component, seed configured users and bind all listeners.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let context = RuntimeContext::new(Role::Server);

        let secret = token_secret(&config).await?;
        let jwt = Arc::new(JwtValidator::new(secret.as_bytes()));
        let store: Arc<dyn UserStore> = match config.users_path() {
            Some(path) => {
                let store = FileUserStore::open(&path).await?;
                info!(path = %path.display(), users = store.len(), "Loaded user store");
                Arc::new(store)
            }
            None => Arc::new(MemoryUserStore::new()),
        };

        let authenticator = Arc::new(
            LocalAuthenticator::new(store.clone(), jwt.clone())
                .with_anonymous(config.anonymous_login),
        );
        for user in &config.users {
            authenticator
                .seed_user(&user.username, &user.password)
                .instrument(context.span().clone())
                .await?;
        }

        let resolver = Arc::new(
            StoreResolver::new(store, jwt).with_banlist(config.users_banlist.iter().copied()),
        );
        let registry = Arc::new(SessionRegistry::new(Arc::new(ReversePool::new())));
        let shutdown = CancellationToken::new();

        let mut allocator = TcpPortAllocator::new(config.bind_ip);
        if let Some(range) = config.public_port_range {
            allocator = allocator.with_range(range.to_range());
        }

        let handler = Arc::new(
            ControlHandler::new(registry.clone(), resolver.clone(), Arc::new(allocator))
                .with_consumer_spawner(consumer_spawner())
                .with_shutdown_token(shutdown.clone())
                .with_request_timeout(config.request_timeout),
        );

        let control = bind_listener("control", SocketAddr::new(config.bind_ip, config.config_port)).await?;
        let provider =
            bind_listener("provider", SocketAddr::new(config.bind_ip, config.provider_port)).await?;
        let web = match config.web_port {
            Some(port) => Some(bind_listener("web", SocketAddr::new(config.bind_ip, port)).await?),
            None => None,
        };

        let addrs = ServerAddrs {
            config: control.local_addr()?,
            provider: provider.local_addr()?,
            web: match &web {
                Some(l) => Some(l.local_addr()?),
                None => None,
            },
        };

        Ok(Self {
            config,
            context,
            addrs,
            listeners: Listeners {
                control,
                provider,
                web,
            },
            handler,
            authenticator,
            handle: ServerHandle {
                shutdown,
                registry,
                resolver,
            },
        })
    }

    pub fn addrs(&self) -> ServerAddrs {
        self.addrs
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until [`ServerHandle::shutdown`] is called.
    pub async fn run(self) -> Result<(), ServerError> {
        let span = self.context.span().clone();
        let shutdown = self.handle.shutdown.clone();
        let registry = self.handle.registry.clone();
        let mut join_set = JoinSet::new();

        join_set.spawn(
            ControlServer::new(self.handler.clone())
                .serve(self.listeners.control, shutdown.clone())
                .instrument(span.clone()),
        );
        join_set.spawn(
            ProviderServer::new(registry.clone())
                .serve(self.listeners.provider, shutdown.clone())
                .instrument(span.clone()),
        );
        join_set.spawn(
            HeartbeatMonitor::new(registry.clone())
                .with_check_interval(self.config.heartbeat_check_interval)
                .with_timeout(self.config.heartbeat_timeout)
                .run(shutdown.clone())
                .instrument(span.clone()),
        );
        if let Some(web) = self.listeners.web {
            let api = ApiServer::new(self.authenticator.clone()).with_registry(registry.clone());
            let api_shutdown = shutdown.clone();
            join_set.spawn(
                async move {
                    if let Err(e) = api.serve(web, api_shutdown).await {
                        warn!("Login API stopped with error: {}", e);
                    }
                }
                .instrument(span.clone()),
            );
        }

        async {
            info!(
                control = %self.addrs.config,
                provider = %self.addrs.provider,
                web = ?self.addrs.web,
                "Burrow server started"
            );
        }
        .instrument(span.clone())
        .await;

        shutdown.cancelled().await;
        registry.close_all();

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                warn!("Server task ended abnormally: {}", e);
            }
        }

        async { info!("Burrow server stopped") }.instrument(span).await;
        Ok(())
    }
}

async fn bind_listener(name: &'static str, addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { name, addr, source })
}

/// Configured secret, else the one persisted in `data_dir`, else a per-run one.
async fn token_secret(config: &ServerConfig) -> Result<String, ServerError> {
    if let Some(secret) = &config.jwt_secret {
        return Ok(secret.clone());
    }
    match config.key_path() {
        Some(path) => read_or_create_key(&path).await,
        None => {
            warn!("No jwt_secret or data_dir configured, generated a random secret; cached client tokens will not survive a restart");
            Ok(random_secret())
        }
    }
}

fn random_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

async fn read_or_create_key(path: &Path) -> Result<String, ServerError> {
    let key_error = |source| ServerError::KeyFile {
        path: path.to_path_buf(),
        source,
    };

    match tokio::fs::read_to_string(path).await {
        Ok(raw) if !raw.trim().is_empty() => {
            debug!(path = %path.display(), "Loaded token secret");
            return Ok(raw.trim().to_string());
        }
        Ok(_) => warn!(path = %path.display(), "Token secret file is empty, generating a new one"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(key_error(e)),
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(key_error)?;
    }
    let secret = random_secret();
    tokio::fs::write(path, &secret).await.map_err(key_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(key_error)?;
    }
    info!(path = %path.display(), "Generated token secret");
    Ok(secret)
}
