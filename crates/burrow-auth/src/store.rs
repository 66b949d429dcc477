//! User records and the lookup boundary the server core depends on
//!
//! [`MemoryUserStore`] forgets everything on restart. [`FileUserStore`] keeps
//! the same maps but rewrites a JSON file after every change, so tokens issued
//! before a restart still resolve to their user afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AuthError;

/// A registered user. `user_id` doubles as the tunnel client id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Opaque key embedded in issued tokens
    pub user_key: String,
    pub user_id: u16,
    pub user_name: String,
    pub password_hash: String,
    pub anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// Key-value lookup of user records
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_key(&self, user_key: &str) -> Option<UserRecord>;

    async fn find_by_name(&self, user_name: &str) -> Option<UserRecord>;

    /// Create a user and assign it the next free nonzero id.
    async fn create(
        &self,
        user_name: &str,
        password_hash: String,
        anonymous: bool,
    ) -> Result<UserRecord, AuthError>;

    async fn remove(&self, user_key: &str) -> Option<UserRecord>;

    /// Replace the stored password hash of an existing user.
    async fn set_password(&self, user_key: &str, password_hash: String) -> Result<(), AuthError>;
}

/// Process-local user store
pub struct MemoryUserStore {
    by_key: DashMap<String, UserRecord>,
    /// user_name -> user_key
    by_name: DashMap<String, String>,
    next_id: AtomicU32,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Rebuild a store from previously saved records.
    pub fn from_records(records: Vec<UserRecord>) -> Result<Self, AuthError> {
        let store = Self::new();
        for record in records {
            if record.user_id == 0 {
                return Err(AuthError::Storage(format!(
                    "user {} has client id 0",
                    record.user_name
                )));
            }
            if store
                .by_name
                .insert(record.user_name.clone(), record.user_key.clone())
                .is_some()
            {
                return Err(AuthError::Storage(format!(
                    "user name {} stored twice",
                    record.user_name
                )));
            }
            store
                .next_id
                .fetch_max(u32::from(record.user_id) + 1, Ordering::SeqCst);
            store.by_key.insert(record.user_key.clone(), record);
        }
        Ok(store)
    }

    /// Every record, ordered by user id
    pub fn records(&self) -> Vec<UserRecord> {
        let mut records: Vec<UserRecord> = self.by_key.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.user_id);
        records
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_key(&self, user_key: &str) -> Option<UserRecord> {
        self.by_key.get(user_key).map(|r| r.value().clone())
    }

    async fn find_by_name(&self, user_name: &str) -> Option<UserRecord> {
        let key = self.by_name.get(user_name)?.value().clone();
        self.find_by_key(&key).await
    }

    async fn create(
        &self,
        user_name: &str,
        password_hash: String,
        anonymous: bool,
    ) -> Result<UserRecord, AuthError> {
        // Reserve the name first so two concurrent registrations cannot both win it
        let user_key = Uuid::new_v4().to_string();
        match self.by_name.entry(user_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(AuthError::UserExists(user_name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(user_key.clone());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id > u16::MAX as u32 {
            self.by_name.remove(user_name);
            return Err(AuthError::IdsExhausted);
        }

        let record = UserRecord {
            user_key: user_key.clone(),
            user_id: id as u16,
            user_name: user_name.to_string(),
            password_hash,
            anonymous,
            created_at: Utc::now(),
        };
        self.by_key.insert(user_key, record.clone());
        Ok(record)
    }

    async fn remove(&self, user_key: &str) -> Option<UserRecord> {
        let (_, record) = self.by_key.remove(user_key)?;
        self.by_name.remove(&record.user_name);
        Some(record)
    }

    async fn set_password(&self, user_key: &str, password_hash: String) -> Result<(), AuthError> {
        let mut record = self.by_key.get_mut(user_key).ok_or(AuthError::UserNotFound)?;
        record.password_hash = password_hash;
        Ok(())
    }
}

/// User store persisted as a JSON array of [`UserRecord`]s
pub struct FileUserStore {
    users: MemoryUserStore,
    path: PathBuf,
    /// Serializes snapshots so the last change is the last write
    writing: tokio::sync::Mutex<()>,
}

impl FileUserStore {
    /// Load `path`, or start empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref().to_path_buf();
        let users = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let records: Vec<UserRecord> = serde_json::from_slice(&raw)
                    .map_err(|e| AuthError::Storage(format!("{}: {}", path.display(), e)))?;
                MemoryUserStore::from_records(records)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryUserStore::new(),
            Err(e) => return Err(AuthError::Storage(format!("{}: {}", path.display(), e))),
        };
        debug!(path = %path.display(), users = users.len(), "Opened user store");
        Ok(Self {
            users,
            path,
            writing: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Write the current records to a sibling temp file, then rename it over `path`.
    async fn save(&self) -> Result<(), AuthError> {
        let _guard = self.writing.lock().await;
        let raw = serde_json::to_vec_pretty(&self.users.records())
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        let written = async {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&staging, &raw).await?;
            tokio::fs::rename(&staging, &self.path).await
        };
        written
            .await
            .map_err(|e| AuthError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn find_by_key(&self, user_key: &str) -> Option<UserRecord> {
        self.users.find_by_key(user_key).await
    }

    async fn find_by_name(&self, user_name: &str) -> Option<UserRecord> {
        self.users.find_by_name(user_name).await
    }

    async fn create(
        &self,
        user_name: &str,
        password_hash: String,
        anonymous: bool,
    ) -> Result<UserRecord, AuthError> {
        let record = self.users.create(user_name, password_hash, anonymous).await?;
        if let Err(e) = self.save().await {
            // Not on disk means not issued
            self.users.remove(&record.user_key).await;
            return Err(e);
        }
        Ok(record)
    }

    async fn remove(&self, user_key: &str) -> Option<UserRecord> {
        let record = self.users.remove(user_key).await?;
        if let Err(e) = self.save().await {
            warn!(user = %record.user_name, "Removed user is still on disk: {}", e);
        }
        Some(record)
    }

    async fn set_password(&self, user_key: &str, password_hash: String) -> Result<(), AuthError> {
        self.users.set_password(user_key, password_hash).await?;
        self.save().await
    }
}
