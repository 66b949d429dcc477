//! Persisted client token
//!
//! The token is reused on the next start without asking the server whether its
//! user still exists. If the user was deleted server-side, registration keeps
//! failing until the cache file is removed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    pub user_id: u16,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when there is no cache file yet.
    pub async fn load(&self) -> Result<Option<CachedToken>, ClientError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cached: CachedToken = serde_json::from_str(&raw).map_err(|e| {
            ClientError::Cache(format!("{} is not a token cache: {}", self.path.display(), e))
        })?;
        if cached.token.is_empty() {
            return Ok(None);
        }
        Ok(Some(cached))
    }

    pub async fn store(&self, token: &str, user_id: u16) -> Result<(), ClientError> {
        let cached = CachedToken {
            token: token.to_string(),
            user_id,
            saved_at: Utc::now(),
        };
        let raw = serde_json::to_string_pretty(&cached)
            .map_err(|e| ClientError::Cache(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, raw).await?;
        debug!(path = %self.path.display(), user_id, "Cached client token");
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
