//! Client-side tracking of reverse connections waiting for a consumer

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Identifies one tracked reverse connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderTicket {
    pub app_id: u8,
    id: u64,
}

/// Pending reverse connections keyed by app id.
///
/// The sockets themselves are owned by their waiting tasks; this table is the
/// bookkeeping that says which of them the session still expects to be opened.
#[derive(Debug, Default)]
pub struct PendingProviders {
    by_app: DashMap<u8, HashSet<u64>>,
    next_id: AtomicU64,
}

impl PendingProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, app_id: u8) -> ProviderTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_app.entry(app_id).or_default().insert(id);
        ProviderTicket { app_id, id }
    }

    /// Stop tracking a connection that was just opened. False means the
    /// session no longer knows it.
    pub fn take(&self, ticket: ProviderTicket) -> bool {
        self.by_app
            .get_mut(&ticket.app_id)
            .map(|mut ids| ids.remove(&ticket.id))
            .unwrap_or(false)
    }

    /// Forget a connection that ended without being opened.
    pub fn forget(&self, ticket: ProviderTicket) {
        self.take(ticket);
    }

    pub fn pending(&self, app_id: u8) -> usize {
        self.by_app.get(&app_id).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_app.iter().map(|e| e.value().len()).sum()
    }

    pub fn clear(&self) {
        self.by_app.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_take_once() {
        let pending = PendingProviders::new();
        let a = pending.track(1);
        let b = pending.track(1);
        let c = pending.track(2);
        assert_eq!(pending.pending(1), 2);
        assert_eq!(pending.total(), 3);

        assert!(pending.take(a));
        assert!(!pending.take(a));
        assert_eq!(pending.pending(1), 1);

        pending.forget(c);
        assert_eq!(pending.pending(2), 0);
        assert!(pending.take(b));
    }

    #[test]
    fn test_clear_invalidates_tickets() {
        let pending = PendingProviders::new();
        let t = pending.track(3);
        pending.clear();
        assert!(!pending.take(t));
        assert_eq!(pending.total(), 0);
    }
}
