//! Pending request tracking and retry backoff.
//!
//! The table maps a correlation id to a single-fire sender, owned exclusively
//! by the bridge event loop. Matching is strictly by correlation id, never by
//! message type: two concurrent requests sharing a response type must not be
//! able to resolve each other.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::wire::protocol::CorrelationId;

/// Resolves one awaiting `request` call with the response payload. Dropping
/// the sender rejects the caller (observed as a disconnect).
pub(crate) type PendingSender = oneshot::Sender<serde_json::Value>;

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<CorrelationId, PendingSender>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request. At most one entry exists per id; a
    /// duplicate replaces (and thereby rejects) the stale entry.
    pub fn register(&mut self, id: CorrelationId, tx: PendingSender) {
        if self.entries.insert(id.clone(), tx).is_some() {
            tracing::warn!(correlation_id = %id, "replaced stale pending request");
        }
    }

    /// Resolve the pending request for `id` with `data`. Returns false when
    /// no such request exists (expired or never registered) — the response is
    /// then safely discarded by the caller.
    pub fn resolve(&mut self, id: &CorrelationId, data: serde_json::Value) -> bool {
        match self.entries.remove(id) {
            Some(tx) => {
                // The requester may have raced a timeout and dropped the
                // receiver; that is not an error.
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    /// Remove a request that timed out on the caller's side.
    pub fn remove(&mut self, id: &CorrelationId) {
        self.entries.remove(id);
    }

    /// Drop every pending sender, rejecting all awaiting callers. Returns the
    /// number of requests failed.
    pub fn fail_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Delay before retry `attempt` (1-based): linear-exponential in the attempt
/// number, `base * attempt`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_fires_exactly_once() {
        let mut table = PendingTable::new();
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();

        table.register(id.clone(), tx);
        assert!(table.resolve(&id, json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), json!({"ok": true}));

        // Second resolution for the same id finds nothing.
        assert!(!table.resolve(&id, json!({})));
    }

    #[test]
    fn unknown_id_is_discarded() {
        let mut table = PendingTable::new();
        assert!(!table.resolve(&CorrelationId::from("nope"), json!({})));
    }

    #[tokio::test]
    async fn duplicate_registration_rejects_the_stale_entry() {
        let mut table = PendingTable::new();
        let id = CorrelationId::from("dup");
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        table.register(id.clone(), tx1);
        table.register(id.clone(), tx2);
        assert_eq!(table.len(), 1);

        assert!(rx1.await.is_err());
        assert!(table.resolve(&id, json!(1)));
        assert_eq!(rx2.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_waiter() {
        let mut table = PendingTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        table.register(CorrelationId::new(), tx_a);
        table.register(CorrelationId::new(), tx_b);

        assert_eq!(table.fail_all(), 2);
        assert_eq!(table.len(), 0);
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        let base = Duration::from_millis(20);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(20));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(60));
    }
}
