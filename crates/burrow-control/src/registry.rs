//! Session registry: connected clients, their apps, and last-seen times
//!
//! Tearing a session down cancels its token (which stops its consumer listeners
//! and every tunnel spawned under them) and closes the app pools it created.
//! All removal paths (explicit close, re-registration, eviction, shutdown) go
//! through the same teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pool::{AppKey, ReversePool};

/// One registered app and the public port it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppBinding {
    pub app_id: u8,
    pub port: u16,
}

/// A logged-in client
#[derive(Debug)]
pub struct ClientSession {
    client_id: u16,
    /// Distinguishes this session from earlier ones of the same client
    session_id: Uuid,
    apps: Vec<AppBinding>,
    last_update: Mutex<Instant>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(client_id: u16, apps: Vec<AppBinding>, parent: &CancellationToken) -> Self {
        Self {
            client_id,
            session_id: Uuid::new_v4(),
            apps,
            last_update: Mutex::new(Instant::now()),
            cancel: parent.child_token(),
            created_at: Utc::now(),
        }
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn apps(&self) -> &[AppBinding] {
        &self.apps
    }

    pub fn app_key(&self, app_id: u8) -> Option<AppKey> {
        self.apps
            .iter()
            .any(|a| a.app_id == app_id)
            .then(|| AppKey::new(self.client_id, app_id))
    }

    /// Token cancelled when the session is torn down
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record activity. Never moves the timestamp backwards.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_update.lock() {
            let now = Instant::now();
            if now > *last {
                *last = now;
            }
        }
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update()) > timeout
    }
}

/// Table of live sessions keyed by client id
pub struct SessionRegistry {
    sessions: DashMap<u16, Arc<ClientSession>>,
    pool: Arc<ReversePool>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ReversePool>) -> Self {
        Self {
            sessions: DashMap::new(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ReversePool> {
        &self.pool
    }

    /// Insert a session, tearing down whatever it replaces.
    pub fn insert(&self, session: Arc<ClientSession>) {
        let client_id = session.client_id;
        info!(
            client_id,
            apps = session.apps.len(),
            "Registered client session"
        );
        if let Some(old) = self.sessions.insert(client_id, session) {
            self.teardown(&old, "replaced");
        }
    }

    pub fn get(&self, client_id: u16) -> Option<Arc<ClientSession>> {
        self.sessions.get(&client_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, client_id: u16) -> bool {
        self.sessions.contains_key(&client_id)
    }

    pub fn apps_of(&self, client_id: u16) -> Option<Vec<AppBinding>> {
        self.sessions.get(&client_id).map(|s| s.apps.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Refresh a client's last-seen time. Returns false for unknown clients.
    pub fn touch(&self, client_id: u16) -> bool {
        match self.sessions.get(&client_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Remove and tear down a client's session.
    pub fn close_client(&self, client_id: u16) -> bool {
        match self.sessions.remove(&client_id) {
            Some((_, session)) => {
                self.teardown(&session, "closed");
                true
            }
            None => false,
        }
    }

    /// Client ids whose sessions have been silent for longer than `timeout`.
    pub fn stale_clients(&self, timeout: Duration) -> Vec<u16> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_stale(now, timeout))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Evict `client_id` if it is still stale at removal time.
    ///
    /// The check and removal happen under the shard lock, so a heartbeat that
    /// lands between the scan and this call keeps the session alive.
    pub fn evict_if_stale(&self, client_id: u16, timeout: Duration) -> bool {
        let now = Instant::now();
        match self
            .sessions
            .remove_if(&client_id, |_, s| s.is_stale(now, timeout))
        {
            Some((_, session)) => {
                self.teardown(&session, "heartbeat timeout");
                true
            }
            None => false,
        }
    }

    /// Tear down every session.
    pub fn close_all(&self) -> usize {
        let ids: Vec<u16> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.close_client(*id)).count()
    }

    fn teardown(&self, session: &ClientSession, reason: &str) {
        session.cancel.cancel();
        let pools = self
            .pool
            .remove_session(session.client_id, session.session_id);
        info!(
            client_id = session.client_id,
            reason,
            pools,
            "Client session torn down"
        );
        debug!(session_id = %session.session_id, created_at = %session.created_at, "Session details");
    }
}
