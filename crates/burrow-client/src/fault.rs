//! First-fault-wins signal shared by every task of one client session

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A condition that ends the current session and triggers a restart
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("app {app_id}: dialing target {target} failed: {reason}")]
    TargetDial {
        app_id: u8,
        target: String,
        reason: String,
    },

    #[error("app {app_id}: reverse connection closed by server")]
    ProviderClosed { app_id: u8 },

    #[error("app {app_id}: reverse connection failed: {reason}")]
    ProviderFailed { app_id: u8, reason: String },

    #[error("app {app_id}: opened reverse connection is not tracked")]
    UntrackedProvider { app_id: u8 },

    #[error("heartbeat failed: {0}")]
    Heartbeat(String),
}

#[derive(Debug)]
struct Inner {
    generation: Uuid,
    fault: OnceLock<Fault>,
    raised: CancellationToken,
}

/// Cloneable handle; only the first [`FaultSignal::raise`] is kept.
///
/// Raising also cancels [`FaultSignal::token`], which every task of the
/// session selects on, so the whole session winds down together.
#[derive(Debug, Clone)]
pub struct FaultSignal {
    inner: Arc<Inner>,
}

impl FaultSignal {
    /// `parent` cancels the session from outside (router close).
    pub fn new(generation: Uuid, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                generation,
                fault: OnceLock::new(),
                raised: parent.child_token(),
            }),
        }
    }

    pub fn generation(&self) -> Uuid {
        self.inner.generation
    }

    /// Report a fault from the session identified by `generation`.
    ///
    /// Reports from an older generation are dropped. Returns true if this
    /// report is the one that was kept.
    pub fn raise(&self, generation: Uuid, fault: Fault) -> bool {
        if generation != self.inner.generation {
            debug!(%generation, "Dropped fault from stale session: {}", fault);
            return false;
        }
        match self.inner.fault.set(fault) {
            Ok(()) => {
                if let Some(fault) = self.inner.fault.get() {
                    warn!(generation = %self.inner.generation, "Session fault: {}", fault);
                }
                self.inner.raised.cancel();
                true
            }
            Err(later) => {
                debug!("Ignored subsequent fault: {}", later);
                false
            }
        }
    }

    pub fn get(&self) -> Option<Fault> {
        self.inner.fault.get().cloned()
    }

    pub fn is_raised(&self) -> bool {
        self.inner.fault.get().is_some()
    }

    /// Cancelled when a fault is raised or the parent is cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.raised
    }

    /// Wait for a fault. `None` means the session was cancelled without one.
    pub async fn wait(&self) -> Option<Fault> {
        self.inner.raised.cancelled().await;
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_fault_wins() {
        let root = CancellationToken::new();
        let gen = Uuid::new_v4();
        let signal = FaultSignal::new(gen, &root);

        assert!(signal.raise(gen, Fault::ProviderClosed { app_id: 1 }));
        assert!(!signal.raise(gen, Fault::Heartbeat("boom".to_string())));
        assert_eq!(signal.wait().await, Some(Fault::ProviderClosed { app_id: 1 }));
        assert!(signal.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let root = CancellationToken::new();
        let signal = FaultSignal::new(Uuid::new_v4(), &root);
        assert!(!signal.raise(Uuid::new_v4(), Fault::ProviderClosed { app_id: 1 }));
        assert!(!signal.is_raised());
        assert!(!signal.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_wakes_without_fault() {
        let root = CancellationToken::new();
        let signal = FaultSignal::new(Uuid::new_v4(), &root);
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        root.cancel();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_raisers_keep_one() {
        let root = CancellationToken::new();
        let gen = Uuid::new_v4();
        let signal = FaultSignal::new(gen, &root);
        let mut tasks = Vec::new();
        for app_id in 1..=16u8 {
            let signal = signal.clone();
            tasks.push(tokio::spawn(async move {
                signal.raise(gen, Fault::ProviderClosed { app_id })
            }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
