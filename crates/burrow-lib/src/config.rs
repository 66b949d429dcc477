//! Server configuration
//!
//! Loadable from YAML or JSON (picked by file extension). Every field has a
//! default, so an empty file is a valid configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_proto::{
    DEFAULT_CONFIG_PORT, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS,
    DEFAULT_PROVIDER_PORT,
};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Inclusive range public ports are chosen from when a client asks for port 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn to_range(self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

/// A user created at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSeed {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub config_port: u16,
    pub provider_port: u16,
    /// Login API port; the API is disabled when unset
    pub web_port: Option<u16>,
    pub public_port_range: Option<PortRange>,
    pub anonymous_login: bool,
    /// Client ids refused at registration
    pub users_banlist: Vec<u16>,
    pub users: Vec<UserSeed>,
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_check_interval: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// HS256 secret for client tokens. When unset it is read from (or
    /// generated into) `data_dir`, or generated per run without a `data_dir`.
    pub jwt_secret: Option<String>,
    /// Where users and the generated token secret are kept across restarts.
    /// Without it both live only as long as the process.
    pub data_dir: Option<PathBuf>,
}

/// User store file inside `data_dir`
pub const USERS_FILE: &str = "users.json";
/// Generated token secret inside `data_dir`
pub const KEY_FILE: &str = "jwt.key";

/// Durations as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config_port: DEFAULT_CONFIG_PORT,
            provider_port: DEFAULT_PROVIDER_PORT,
            web_port: None,
            public_port_range: None,
            anonymous_login: false,
            users_banlist: Vec::new(),
            users: Vec::new(),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            heartbeat_check_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            request_timeout: burrow_control::DEFAULT_REQUEST_TIMEOUT,
            jwt_secret: None,
            data_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(|e| ServerError::Config(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| ServerError::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if let Some(range) = self.public_port_range {
            if range.start == 0 || range.start > range.end {
                return Err(ServerError::Config(format!(
                    "invalid public port range {}-{}",
                    range.start, range.end
                )));
            }
        }
        if self.heartbeat_check_interval.is_zero() {
            return Err(ServerError::Config(
                "heartbeat_check_interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_config_port(mut self, port: u16) -> Self {
        self.config_port = port;
        self
    }

    pub fn with_provider_port(mut self, port: u16) -> Self {
        self.provider_port = port;
        self
    }

    pub fn with_web_port(mut self, port: u16) -> Self {
        self.web_port = Some(port);
        self
    }

    pub fn with_public_port_range(mut self, start: u16, end: u16) -> Self {
        self.public_port_range = Some(PortRange { start, end });
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn users_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(USERS_FILE))
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(KEY_FILE))
    }

    pub fn with_anonymous_login(mut self, enabled: bool) -> Self {
        self.anonymous_login = enabled;
        self
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.push(UserSeed {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn with_banned(mut self, client_id: u16) -> Self {
        self.users_banlist.push(client_id);
        self
    }

    pub fn with_heartbeat(mut self, check_interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_check_interval = check_interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_jwt_secret(mut self, secret: &str) -> Self {
        self.jwt_secret = Some(secret.to_string());
        self
    }

    /// Config bound to loopback with OS-assigned ports everywhere, web API on.
    pub fn ephemeral() -> Self {
        Self::default()
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_config_port(0)
            .with_provider_port(0)
            .with_web_port(0)
    }
}
