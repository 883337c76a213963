//! Running connection counters, derived passively from the other
//! components' activity.
//!
//! The aggregator owns the mutable state; callers only ever receive a
//! [`ConnectionStats`] snapshot copy, never a live reference, so reads are
//! never torn by concurrent updates.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Weight of the previous average in the latency EMA.
const EMA_KEEP: f64 = 0.9;
/// Weight of the newest sample in the latency EMA.
const EMA_SAMPLE: f64 = 0.1;

/// Point-in-time copy of the client's counters.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Malformed inbound frames and surfaced connection-level errors
    pub errors: u64,
    /// Envelopes displaced or refused by queue overflow
    pub evictions: u64,
    /// Envelopes permanently failed after retry exhaustion
    pub delivery_failures: u64,
    /// Reconnection attempts scheduled after unexpected closes
    pub reconnects: u64,
    /// Exponential moving average of heartbeat round-trip latency
    pub avg_latency: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct StatsAggregator {
    inner: RwLock<ConnectionStats>,
}

impl StatsAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> ConnectionStats {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reset(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = ConnectionStats::default();
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        let mut stats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        stats.messages_sent += 1;
        stats.bytes_sent += bytes;
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        let mut stats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        stats.messages_received += 1;
        stats.bytes_received += bytes;
    }

    pub(crate) fn record_error(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .errors += 1;
    }

    pub(crate) fn record_eviction(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .evictions += 1;
    }

    pub(crate) fn record_delivery_failure(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .delivery_failures += 1;
    }

    pub(crate) fn record_reconnect(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reconnects += 1;
    }

    /// Feed a round-trip latency sample into the moving average.
    /// The first sample seeds the average directly.
    pub(crate) fn record_latency(&self, sample: Duration) {
        let mut stats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        stats.avg_latency = Some(match stats.avg_latency {
            Some(avg) => Duration::from_secs_f64(
                avg.as_secs_f64() * EMA_KEEP + sample.as_secs_f64() * EMA_SAMPLE,
            ),
            None => sample,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_copy() {
        let aggregator = StatsAggregator::new();
        aggregator.record_sent(10);

        let before = aggregator.snapshot();
        aggregator.record_sent(10);
        let after = aggregator.snapshot();

        assert_eq!(before.messages_sent, 1);
        assert_eq!(after.messages_sent, 2);
        assert_eq!(after.bytes_sent, 20);
    }

    #[test]
    fn first_latency_sample_seeds_average() {
        let aggregator = StatsAggregator::new();
        aggregator.record_latency(Duration::from_millis(80));

        assert_eq!(
            aggregator.snapshot().avg_latency,
            Some(Duration::from_millis(80))
        );
    }

    #[test]
    fn constant_samples_converge_within_forty() {
        let aggregator = StatsAggregator::new();
        let target = Duration::from_millis(100);

        // Seed far from the target, then feed a constant signal.
        aggregator.record_latency(Duration::ZERO);
        for _ in 0..40 {
            aggregator.record_latency(target);
        }

        let avg = aggregator
            .snapshot()
            .avg_latency
            .expect("average must be seeded");
        let error = (avg.as_secs_f64() - target.as_secs_f64()).abs() / target.as_secs_f64();
        assert!(error < 0.01, "EMA off by {error:.4} after 40 samples");
    }

    #[test]
    fn reset_clears_counters_and_average() {
        let aggregator = StatsAggregator::new();
        aggregator.record_sent(5);
        aggregator.record_error();
        aggregator.record_latency(Duration::from_millis(10));

        aggregator.reset();
        assert_eq!(aggregator.snapshot(), ConnectionStats::default());
    }
}
