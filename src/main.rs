//! Burrow CLI - reverse tunnel server and client
//!
//! Expose services behind NAT through a public server without inbound access.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burrow_client::{ClientConfig, ClientStatus, LoginInfo, Router, RunMode};
use burrow_lib::{ServerConfig, TunnelServer};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Burrow - reverse tunnel proxy
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose internal services through a public server")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public server
    #[command(long_about = r#"
Run the public side of the tunnel: the control port clients register on, the
provider port their reverse connections arrive on, and optionally the HTTP
login API.

EXAMPLES:
  # Defaults (control 12308, provider 19974), anonymous clients allowed
  burrow server --web-port 12309 --anonymous --jwt-secret "$SECRET"

  # Everything from a file, overriding the bind address
  burrow server --config server.yaml --bind 0.0.0.0

ENVIRONMENT VARIABLES:
  BURROW_CONFIG      Server config file (YAML or JSON)
  BURROW_JWT_SECRET  Secret used to sign client tokens
    "#)]
    Server {
        /// Config file (.yaml, .yml or .json)
        #[arg(long, env = "BURROW_CONFIG")]
        config: Option<PathBuf>,

        /// Interface to bind all listeners on
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Control port
        #[arg(long)]
        config_port: Option<u16>,

        /// Reverse connection port
        #[arg(long)]
        provider_port: Option<u16>,

        /// Login API port (disabled unless set here or in the config file)
        #[arg(long)]
        web_port: Option<u16>,

        /// Token signing secret
        #[arg(long, env = "BURROW_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// Allow anonymous client registration
        #[arg(long)]
        anonymous: bool,

        /// Directory holding the user store and generated token secret
        #[arg(long, env = "BURROW_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Run a client exposing the configured apps
    #[command(long_about = r#"
Log in to a burrow server, register the apps listed in the config file and
keep their tunnels up, reconnecting after any failure.

EXAMPLES:
  burrow client --config client.yaml
  burrow client --config client.yaml --server tunnel.example.com \
    --username alice --password "$PASSWORD"
    "#)]
    Client {
        /// Config file (.yaml, .yml or .json)
        #[arg(long, env = "BURROW_CLIENT_CONFIG")]
        config: PathBuf,

        /// Server host, overriding the config file
        #[arg(long, env = "BURROW_SERVER")]
        server: Option<String>,

        /// Login user name
        #[arg(long, env = "BURROW_USERNAME", requires = "password")]
        username: Option<String>,

        /// Login password
        #[arg(long, env = "BURROW_PASSWORD", requires = "username")]
        password: Option<String>,

        /// Keep retrying even if the first attempt never connects
        #[arg(long)]
        always_reconnect: bool,
    },
}

/// Setup logging; `RUST_LOG` wins over `--verbose`
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    config: Option<PathBuf>,
    bind: Option<IpAddr>,
    config_port: Option<u16>,
    provider_port: Option<u16>,
    web_port: Option<u16>,
    jwt_secret: Option<String>,
    anonymous: bool,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => ServerConfig::from_file(&path)
            .with_context(|| format!("Failed to load server config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(ip) = bind {
        config = config.with_bind_ip(ip);
    }
    if let Some(port) = config_port {
        config = config.with_config_port(port);
    }
    if let Some(port) = provider_port {
        config = config.with_provider_port(port);
    }
    if let Some(port) = web_port {
        config = config.with_web_port(port);
    }
    if let Some(secret) = jwt_secret {
        config = config.with_jwt_secret(&secret);
    }
    if anonymous {
        config = config.with_anonymous_login(true);
    }
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }

    info!("Burrow server {} starting", VERSION);
    info!("Bind address: {}", config.bind_ip);
    info!("Public port range: {:?}", config.public_port_range);
    info!("Anonymous login: {}", config.anonymous_login);
    match &config.data_dir {
        Some(dir) => info!("Data directory: {}", dir.display()),
        None => info!("Data directory: none (users and secret kept in memory)"),
    }
    info!(
        "Heartbeat timeout: {:?} (checked every {:?})",
        config.heartbeat_timeout, config.heartbeat_check_interval
    );

    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start server")?;
    let handle = server.handle();
    let mut task = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            handle.shutdown();
            task.await.context("Server task panicked")??;
        }
        result = &mut task => {
            result.context("Server task panicked")??;
        }
    }

    info!("Burrow server stopped");
    Ok(())
}

async fn run_client(
    config: PathBuf,
    server: Option<String>,
    username: Option<String>,
    password: Option<String>,
    always_reconnect: bool,
) -> Result<()> {
    let mut config = ClientConfig::from_file(&config)
        .with_context(|| format!("Failed to load client config {}", config.display()))?;
    if let Some(server) = server {
        config.server_address = server;
    }
    if let (Some(username), Some(password)) = (username, password) {
        config.login = Some(LoginInfo { username, password });
    }

    info!("Burrow client {} starting", VERSION);
    info!(
        "Server: {} (control {}, provider {}, web {})",
        config.server_address, config.config_port, config.provider_port, config.web_port
    );
    for (i, app) in config.apps.iter().enumerate() {
        info!("App {}: {} (public port hint {})", i + 1, app.target(), app.public_port);
    }
    if config.login.is_none() {
        info!("No credentials given, using cached token or anonymous login");
    }

    let mut router = Router::new(config)
        .context("Failed to create client")?
        .with_run_mode(RunMode {
            always_reconnect,
            single_shot: false,
        });
    let mut status = router.subscribe();
    let handle = router.handle();

    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            match event.status {
                ClientStatus::Started => info!("Tunnels up: {}", event.tunnels.join(", ")),
                ClientStatus::Stopped => info!("Tunnels down"),
                ClientStatus::LoginError => warn!("Login failed"),
            }
        }
    });

    let mut task = tokio::spawn(router.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            handle.close().await;
            task.await.context("Client task panicked")??;
        }
        result = &mut task => {
            match result.context("Client task panicked")? {
                Ok(()) => info!("Client stopped"),
                Err(e) => {
                    error!("Client error: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Burrow client stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            config,
            bind,
            config_port,
            provider_port,
            web_port,
            jwt_secret,
            anonymous,
            data_dir,
        } => {
            run_server(
                config,
                bind,
                config_port,
                provider_port,
                web_port,
                jwt_secret,
                anonymous,
                data_dir,
            )
            .await
        }
        Commands::Client {
            config,
            server,
            username,
            password,
            always_reconnect,
        } => run_client(config, server, username, password, always_reconnect).await,
    }
}
