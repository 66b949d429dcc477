//! Server-side reverse connection pool
//!
//! One [`AppPool`] per (client, app). Providers push idle reverse connections in;
//! consumer handlers take them out with [`AppPool::acquire`], which suspends until
//! an entry exists. Removal happens under the pool mutex, so an entry can be
//! handed to at most one acquirer. A [`ReservedConnection`] is already out of the
//! pool by the time the caller sees it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool for client {client_id} app {app_id} is closed")]
    Closed { client_id: u16, app_id: u8 },

    #[error("No pool for client {client_id} app {app_id}")]
    UnknownApp { client_id: u16, app_id: u8 },
}

/// Identifies one app of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppKey {
    pub client_id: u16,
    pub app_id: u8,
}

impl AppKey {
    pub fn new(client_id: u16, app_id: u8) -> Self {
        Self { client_id, app_id }
    }

    /// Diagnostic label used in relay logs
    pub fn label(&self) -> String {
        format!("clientapp:{}-{}", self.client_id, self.app_id)
    }
}

struct IdleConnection {
    stream: TcpStream,
    peer: SocketAddr,
    pooled_at: Instant,
}

impl IdleConnection {
    /// Best effort: a provider that hung up while idle shows EOF without blocking.
    fn is_stale(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.try_read(&mut byte) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            // EOF, error, or bytes the provider should not have sent before TunnelOpen
            _ => true,
        }
    }
}

/// A reverse connection taken out of its pool for exactly one tunnel
#[derive(Debug)]
pub struct ReservedConnection {
    key: AppKey,
    stream: TcpStream,
    peer: SocketAddr,
}

impl ReservedConnection {
    pub fn key(&self) -> AppKey {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Idle reverse connections for one app
pub struct AppPool {
    key: AppKey,
    /// Session that created this pool
    owner: Uuid,
    idle: Mutex<VecDeque<IdleConnection>>,
    available: Notify,
    closed: CancellationToken,
}

impl AppPool {
    pub fn new(key: AppKey, owner: Uuid, closed: CancellationToken) -> Self {
        Self {
            key,
            owner,
            idle: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            closed,
        }
    }

    pub fn key(&self) -> AppKey {
        self.key
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            client_id: self.key.client_id,
            app_id: self.key.app_id,
        }
    }

    /// Add an idle reverse connection. A closed pool drops it.
    pub fn push(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), PoolError> {
        {
            let mut idle = self.idle.lock().map_err(|_| self.closed_error())?;
            if self.closed.is_cancelled() {
                return Err(self.closed_error());
            }
            idle.push_back(IdleConnection {
                stream,
                peer,
                pooled_at: Instant::now(),
            });
            trace!(client_id = self.key.client_id, app_id = self.key.app_id, idle = idle.len(), "Pooled reverse connection");
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take any live idle entry without waiting.
    pub fn try_acquire(&self) -> Option<ReservedConnection> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(entry) = idle.pop_front() {
            if entry.is_stale() {
                debug!(
                    client_id = self.key.client_id,
                    app_id = self.key.app_id,
                    peer = %entry.peer,
                    idle_for = ?entry.pooled_at.elapsed(),
                    "Discarding stale reverse connection"
                );
                continue;
            }
            return Some(ReservedConnection {
                key: self.key,
                stream: entry.stream,
                peer: entry.peer,
            });
        }
        None
    }

    /// Wait until an idle entry exists and take it.
    ///
    /// Fails only when the pool is closed; there is no timeout.
    pub async fn acquire(&self) -> Result<ReservedConnection, PoolError> {
        loop {
            // Register interest before checking, so a push between check and wait is not lost
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.is_cancelled() {
                return Err(self.closed_error());
            }
            if let Some(conn) = self.try_acquire() {
                return Ok(conn);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => return Err(self.closed_error()),
            }
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Close the pool and drop every idle entry. Waiting acquirers fail.
    pub fn close(&self) {
        self.closed.cancel();
        let drained: Vec<IdleConnection> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            debug!(
                client_id = self.key.client_id,
                app_id = self.key.app_id,
                count = drained.len(),
                "Closed idle reverse connections"
            );
        }
    }
}

/// All app pools on the server
pub struct ReversePool {
    pools: DashMap<AppKey, Arc<AppPool>>,
}

impl ReversePool {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Create the pool for `key`, closing any pool it replaces.
    pub fn register(&self, key: AppKey, owner: Uuid, closed: CancellationToken) -> Arc<AppPool> {
        let pool = Arc::new(AppPool::new(key, owner, closed));
        if let Some(old) = self.pools.insert(key, pool.clone()) {
            old.close();
        }
        pool
    }

    pub fn get(&self, key: AppKey) -> Option<Arc<AppPool>> {
        self.pools.get(&key).map(|p| p.value().clone())
    }

    /// Route a freshly connected reverse connection into its app pool.
    pub fn push(&self, key: AppKey, stream: TcpStream, peer: SocketAddr) -> Result<(), PoolError> {
        let pool = self.get(key).ok_or(PoolError::UnknownApp {
            client_id: key.client_id,
            app_id: key.app_id,
        })?;
        pool.push(stream, peer)
    }

    /// Close and forget every pool created by session `owner` of `client_id`.
    pub fn remove_session(&self, client_id: u16, owner: Uuid) -> usize {
        let mut removed = Vec::new();
        self.pools.retain(|key, pool| {
            if key.client_id == client_id && pool.owner == owner {
                removed.push(pool.clone());
                false
            } else {
                true
            }
        });
        for pool in &removed {
            pool.close();
        }
        removed.len()
    }

    pub fn idle_count(&self, key: AppKey) -> usize {
        self.get(key).map(|p| p.idle_len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Default for ReversePool {
    fn default() -> Self {
        Self::new()
    }
}
