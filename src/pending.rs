//! Table of sent messages awaiting delivery confirmation.
//!
//! Every entry has exactly one deadline and is removed exactly once: by a
//! matching ack, by deadline expiry, or by cancellation on disconnect.
//! Expiry is driven by a single periodic sweep rather than one timer per
//! entry. All three paths run on the connection actor task, and removal from
//! the map is the single atomic claim that resolves ack/timeout races.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::Result;
use crate::error::Error;

struct PendingEntry {
    deadline: Instant,
    completion: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
pub(crate) struct PendingAckTable {
    entries: HashMap<Uuid, PendingEntry>,
}

impl PendingAckTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn register(
        &mut self,
        id: Uuid,
        deadline: Instant,
        completion: oneshot::Sender<Result<()>>,
    ) {
        self.entries.insert(id, PendingEntry {
            deadline,
            completion,
        });
    }

    /// Fulfill the entry for `id`. Unknown ids (late or duplicate acks) are a
    /// no-op, not an error.
    pub(crate) fn resolve(&mut self, id: &Uuid) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                drop(entry.completion.send(Ok(())));
                true
            }
            None => false,
        }
    }

    /// Reject every entry whose deadline has passed. Returns how many expired.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                drop(entry.completion.send(Err(Error::timeout(format!("ack of {id}")))));
            }
        }
        expired.len()
    }

    /// Reject every outstanding entry, used by explicit disconnect.
    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            drop(entry.completion.send(Err(Error::cancelled())));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn resolve_fulfills_exactly_once() {
        let mut table = PendingAckTable::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();

        table.register(id, Instant::now() + Duration::from_secs(1), tx);
        assert!(table.resolve(&id));
        assert!(!table.resolve(&id), "duplicate ack must be a no-op");

        assert!(rx.try_recv().expect("completion missing").is_ok());
    }

    #[test]
    fn sweep_rejects_expired_with_timeout() {
        let mut table = PendingAckTable::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();

        table.register(id, Instant::now() - Duration::from_millis(1), tx);
        assert_eq!(table.sweep(Instant::now()), 1);
        assert_eq!(table.len(), 0);

        let err = rx
            .try_recv()
            .expect("completion missing")
            .expect_err("expired entry must reject");
        assert_eq!(err.kind(), Kind::Timeout);
    }

    #[test]
    fn sweep_spares_entries_still_in_deadline() {
        let mut table = PendingAckTable::new();
        let (tx, _rx) = oneshot::channel();

        table.register(Uuid::new_v4(), Instant::now() + Duration::from_secs(5), tx);
        assert_eq!(table.sweep(Instant::now()), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ack_and_timeout_race_resolves_exactly_once() {
        // Ack first, then sweep: the sweep must not touch the claimed entry.
        let mut table = PendingAckTable::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();
        table.register(id, Instant::now() - Duration::from_millis(1), tx);

        assert!(table.resolve(&id));
        assert_eq!(table.sweep(Instant::now()), 0);
        assert!(rx.try_recv().expect("completion missing").is_ok());

        // Sweep first, then a late ack: the ack must be a no-op.
        let (tx, mut rx) = oneshot::channel();
        table.register(id, Instant::now() - Duration::from_millis(1), tx);

        assert_eq!(table.sweep(Instant::now()), 1);
        assert!(!table.resolve(&id));
        let err = rx
            .try_recv()
            .expect("completion missing")
            .expect_err("timeout must have won");
        assert_eq!(err.kind(), Kind::Timeout);
    }

    #[test]
    fn cancel_all_rejects_with_cancelled() {
        let mut table = PendingAckTable::new();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);

        table.register(Uuid::new_v4(), deadline, tx_a);
        table.register(Uuid::new_v4(), deadline, tx_b);
        table.cancel_all();
        assert_eq!(table.len(), 0);

        for rx in [&mut rx_a, &mut rx_b] {
            let err = rx
                .try_recv()
                .expect("completion missing")
                .expect_err("cancelled entry must reject");
            assert_eq!(err.kind(), Kind::Cancelled);
        }
    }
}
