//! Bounded FIFO buffer for envelopes submitted before the worker is ready.
//!
//! Overflow policy is drop-oldest: a full queue evicts its head to make room
//! for the new message, trading completeness for availability on best-effort
//! sends. Eviction is logged, never surfaced as an error.

use std::collections::VecDeque;
use std::time::Instant;

use crate::wire::protocol::Envelope;

#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub(crate) struct OutboundQueue {
    capacity: usize,
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    /// Insert at the tail, evicting the oldest entry when at capacity.
    pub fn enqueue(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            tracing::warn!(kind = %envelope.kind, "outbound queue disabled, dropping message");
            return;
        }
        if self.entries.len() >= self.capacity
            && let Some(dropped) = self.entries.pop_front()
        {
            tracing::warn!(
                kind = %dropped.envelope.kind,
                capacity = self.capacity,
                "outbound queue full, evicting oldest message"
            );
        }
        self.entries.push_back(QueuedMessage {
            envelope,
            enqueued_at: Instant::now(),
        });
    }

    /// Pop the oldest entry.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put a message back at the head after a failed send.
    pub fn requeue(&mut self, message: QueuedMessage) {
        if self.entries.len() >= self.capacity {
            // Head insertion would displace the message we are restoring, so
            // just drop it and keep the newer entries.
            tracing::warn!(kind = %message.envelope.kind, "queue full, dropping failed message");
            return;
        }
        self.entries.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(n: usize) -> Envelope {
        Envelope::new("task", json!({ "n": n }))
    }

    #[test]
    fn fifo_order_preserved() {
        let mut queue = OutboundQueue::new(4);
        for n in 0..3 {
            queue.enqueue(envelope(n));
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.envelope.data["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let capacity = 3;
        let extra = 2;
        let mut queue = OutboundQueue::new(capacity);
        for n in 0..capacity + extra {
            queue.enqueue(envelope(n));
        }

        assert_eq!(queue.len(), capacity);
        let retained: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.envelope.data["n"].as_u64().unwrap() as usize)
            .collect();
        // Exactly the most recent `capacity` messages survive.
        assert_eq!(retained, vec![extra, extra + 1, extra + 2]);
    }

    #[test]
    fn requeue_restores_head_position() {
        let mut queue = OutboundQueue::new(4);
        queue.enqueue(envelope(0));
        queue.enqueue(envelope(1));

        let failed = queue.pop().unwrap();
        queue.requeue(failed);

        assert_eq!(queue.pop().unwrap().envelope.data["n"], json!(0));
        assert_eq!(queue.pop().unwrap().envelope.data["n"], json!(1));
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let mut queue = OutboundQueue::new(0);
        queue.enqueue(envelope(0));
        assert!(queue.is_empty());
    }
}
