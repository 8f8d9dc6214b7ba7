//! Bridge traffic counters and rolling latency.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Snapshot of bridge metrics. Counters are monotonic between resets; the
/// average latency is folded incrementally as requests resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMetrics {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub average_latency: Duration,
    pub last_message_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    sent: u64,
    received: u64,
    errors: u64,
    average_latency: Duration,
    last_message_time: Option<DateTime<Utc>>,
}

impl MetricsInner {
    pub fn record_sent(&mut self) {
        self.sent += 1;
        self.last_message_time = Some(Utc::now());
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Fold one resolved request's latency into the running average:
    /// `avg' = (avg*(n-1) + latest) / n` with `n` the current sent count.
    pub fn record_latency(&mut self, latest: Duration) {
        let n = self.sent.max(1);
        let avg = (self.average_latency.as_secs_f64() * (n - 1) as f64 + latest.as_secs_f64())
            / n as f64;
        self.average_latency = Duration::from_secs_f64(avg);
    }

    pub fn snapshot(&self) -> BridgeMetrics {
        BridgeMetrics {
            sent: self.sent,
            received: self.received,
            errors: self.errors,
            average_latency: self.average_latency,
            last_message_time: self.last_message_time,
        }
    }

    /// Zero all counters. Does not touch connection state or pendings.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
