//! Client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_proto::{
    DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_CONFIG_PORT, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_PROVIDER_PORT, DEFAULT_RECONNECT_INTERVAL_MS,
    DEFAULT_WEB_PORT,
};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub const DEFAULT_CACHE_PATH: &str = "./burrow_client.cache";

/// One internal service to expose. Its app id is its position in the list, from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub target_host: String,
    pub target_port: u16,
    /// Public port to ask the server for; 0 lets the server choose.
    #[serde(default)]
    pub public_port: u16,
    #[serde(default)]
    pub description: Option<String>,
}

impl AppConfig {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            public_port: 0,
            description: None,
        }
    }

    pub fn with_public_port(mut self, port: u16) -> Self {
        self.public_port = port;
        self
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub config_port: u16,
    pub provider_port: u16,
    pub web_port: u16,
    pub apps: Vec<AppConfig>,
    pub login: Option<LoginInfo>,
    pub cache_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_interval: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Same, in milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            config_port: DEFAULT_CONFIG_PORT,
            provider_port: DEFAULT_PROVIDER_PORT,
            web_port: DEFAULT_WEB_PORT,
            apps: Vec::new(),
            login: None,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(|e| ClientError::Config(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| ClientError::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_address.is_empty() {
            return Err(ClientError::Config("server_address is required".to_string()));
        }
        if self.apps.is_empty() {
            return Err(ClientError::Config(
                "at least one app must be configured".to_string(),
            ));
        }
        if self.apps.len() > u8::MAX as usize {
            return Err(ClientError::Config(format!(
                "at most {} apps are supported, got {}",
                u8::MAX,
                self.apps.len()
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::Config(
                "heartbeat_interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_hints(&self) -> Vec<u16> {
        self.apps.iter().map(|a| a.public_port).collect()
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.server_address, self.config_port)
    }

    pub fn provider_addr(&self) -> String {
        format!("{}:{}", self.server_address, self.provider_port)
    }

    pub fn login_url(&self) -> String {
        format!("http://{}:{}/api/v1/login", self.server_address, self.web_port)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server(mut self, address: impl Into<String>) -> Self {
        self.config.server_address = address.into();
        self
    }

    pub fn ports(mut self, config_port: u16, provider_port: u16, web_port: u16) -> Self {
        self.config.config_port = config_port;
        self.config.provider_port = provider_port;
        self.config.web_port = web_port;
        self
    }

    pub fn app(mut self, app: AppConfig) -> Self {
        self.config.apps.push(app);
        self
    }

    pub fn login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.login = Some(LoginInfo {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_path = path.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
