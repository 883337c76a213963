//! Bounded, priority-ordered holding area for envelopes that cannot be sent
//! immediately (not yet connected, or burst arrival).
//!
//! Ordering within a tier is FIFO; across tiers it is priority-first. The
//! capacity invariant is absolute: at most `capacity` envelopes are resident,
//! and overflow evicts the lowest-priority-oldest envelope when the arrival
//! outranks or equals it, otherwise the arrival itself is refused.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::Result;
use crate::frame::{Envelope, Priority};

/// An envelope travelling through the queue together with its caller-facing
/// completion handle and optional ack deadline.
#[derive(Debug)]
pub(crate) struct QueuedSend {
    pub envelope: Envelope,
    /// Resolves the caller's delivery future. `None` once the caller dropped it.
    pub completion: Option<oneshot::Sender<Result<()>>>,
    pub ack_timeout: Option<Duration>,
}

impl QueuedSend {
    pub(crate) fn new(
        envelope: Envelope,
        completion: oneshot::Sender<Result<()>>,
        ack_timeout: Option<Duration>,
    ) -> Self {
        Self {
            envelope,
            completion: Some(completion),
            ack_timeout,
        }
    }
}

/// Result of an insertion attempt.
#[derive(Debug)]
pub(crate) enum EnqueueOutcome {
    /// Admitted without displacing anything
    Queued,
    /// Admitted; the returned lowest-priority-oldest occupant was evicted
    Evicted(QueuedSend),
    /// Queue full of strictly higher-priority envelopes; the arrival is refused
    Refused(QueuedSend),
}

pub(crate) struct OutboundQueue {
    tiers: [VecDeque<QueuedSend>; Priority::COUNT],
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Insert at the back of the envelope's tier, evicting if at capacity.
    pub(crate) fn enqueue(&mut self, item: QueuedSend) -> EnqueueOutcome {
        match self.make_room(item.envelope.priority) {
            RoomOutcome::Available => {
                self.tiers[item.envelope.priority.tier()].push_back(item);
                EnqueueOutcome::Queued
            }
            RoomOutcome::Evicted(victim) => {
                self.tiers[item.envelope.priority.tier()].push_back(item);
                EnqueueOutcome::Evicted(victim)
            }
            RoomOutcome::Full => EnqueueOutcome::Refused(item),
        }
    }

    /// Return a failed envelope to the *front* of its tier so it is retried
    /// before anything younger in the same tier.
    pub(crate) fn requeue_front(&mut self, item: QueuedSend) -> EnqueueOutcome {
        match self.make_room(item.envelope.priority) {
            RoomOutcome::Available => {
                self.tiers[item.envelope.priority.tier()].push_front(item);
                EnqueueOutcome::Queued
            }
            RoomOutcome::Evicted(victim) => {
                self.tiers[item.envelope.priority.tier()].push_front(item);
                EnqueueOutcome::Evicted(victim)
            }
            RoomOutcome::Full => EnqueueOutcome::Refused(item),
        }
    }

    /// Pop the highest-priority, oldest envelope.
    pub(crate) fn pop(&mut self) -> Option<QueuedSend> {
        self.tiers
            .iter_mut()
            .rev()
            .find(|tier| !tier.is_empty())
            .and_then(VecDeque::pop_front)
    }

    /// Remove everything, e.g. to reject all pending deliveries on disconnect.
    pub(crate) fn drain_all(&mut self) -> Vec<QueuedSend> {
        let mut all = Vec::with_capacity(self.len());
        while let Some(item) = self.pop() {
            all.push(item);
        }
        all
    }

    fn make_room(&mut self, incoming: Priority) -> RoomOutcome {
        if self.len() < self.capacity {
            return RoomOutcome::Available;
        }
        // Victim is the oldest envelope of the lowest occupied tier, but only
        // when the arrival outranks or equals it.
        let victim_tier = match self.tiers.iter().position(|tier| !tier.is_empty()) {
            Some(tier) if tier <= incoming.tier() => tier,
            _ => return RoomOutcome::Full,
        };
        match self.tiers[victim_tier].pop_front() {
            Some(victim) => RoomOutcome::Evicted(victim),
            None => RoomOutcome::Available,
        }
    }
}

enum RoomOutcome {
    Available,
    Evicted(QueuedSend),
    Full,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn item(seq: u64, priority: Priority) -> QueuedSend {
        QueuedSend {
            envelope: Envelope::new(seq, "test".to_owned(), json!({"seq": seq}), priority, 3),
            completion: None,
            ack_timeout: None,
        }
    }

    #[test]
    fn pop_is_priority_first_then_fifo() {
        let mut queue = OutboundQueue::new(10);
        assert!(matches!(
            queue.enqueue(item(1, Priority::Normal)),
            EnqueueOutcome::Queued
        ));
        assert!(matches!(
            queue.enqueue(item(2, Priority::High)),
            EnqueueOutcome::Queued
        ));
        assert!(matches!(
            queue.enqueue(item(3, Priority::Normal)),
            EnqueueOutcome::Queued
        ));
        assert!(matches!(
            queue.enqueue(item(4, Priority::Low)),
            EnqueueOutcome::Queued
        ));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.envelope.seq)
            .collect();
        assert_eq!(order, vec![2, 1, 3, 4]);
    }

    #[test]
    fn overflow_evicts_lowest_priority_oldest() {
        let mut queue = OutboundQueue::new(2);
        assert!(matches!(
            queue.enqueue(item(1, Priority::Low)),
            EnqueueOutcome::Queued
        ));
        assert!(matches!(
            queue.enqueue(item(2, Priority::Normal)),
            EnqueueOutcome::Queued
        ));

        // High arrival displaces the low envelope, never the normal one
        match queue.enqueue(item(3, Priority::High)) {
            EnqueueOutcome::Evicted(victim) => {
                assert_eq!(victim.envelope.seq, 1);
                assert_eq!(victim.envelope.priority, Priority::Low);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.envelope.seq)
            .collect();
        assert_eq!(order, vec![3, 2]);
    }

    #[test]
    fn overflow_refuses_arrival_outranked_by_all_residents() {
        let mut queue = OutboundQueue::new(2);
        assert!(matches!(
            queue.enqueue(item(1, Priority::High)),
            EnqueueOutcome::Queued
        ));
        assert!(matches!(
            queue.enqueue(item(2, Priority::High)),
            EnqueueOutcome::Queued
        ));

        match queue.enqueue(item(3, Priority::Low)) {
            EnqueueOutcome::Refused(refused) => assert_eq!(refused.envelope.seq, 3),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn capacity_never_exceeded_under_burst() {
        let mut queue = OutboundQueue::new(5);
        for seq in 0..50 {
            let priority = match seq % 3 {
                0 => Priority::Low,
                1 => Priority::Normal,
                _ => Priority::High,
            };
            let _ = queue.enqueue(item(seq, priority));
            assert!(queue.len() <= 5, "capacity invariant violated at seq {seq}");
        }
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn equal_priority_evicts_oldest_insertion() {
        let mut queue = OutboundQueue::new(2);
        let _ = queue.enqueue(item(1, Priority::Normal));
        let _ = queue.enqueue(item(2, Priority::Normal));

        match queue.enqueue(item(3, Priority::Normal)) {
            EnqueueOutcome::Evicted(victim) => assert_eq!(victim.envelope.seq, 1),
            other => panic!("expected eviction, got {other:?}"),
        }
    }

    #[test]
    fn requeue_front_precedes_same_tier() {
        let mut queue = OutboundQueue::new(10);
        let _ = queue.enqueue(item(1, Priority::Normal));
        let _ = queue.enqueue(item(2, Priority::Normal));

        let first = queue.pop().expect("queued item");
        assert_eq!(first.envelope.seq, 1);
        let _ = queue.requeue_front(first);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.envelope.seq)
            .collect();
        assert_eq!(order, vec![1, 2]);
    }
}
