#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MISSED_BEAT_TOLERANCE: u32 = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SEND_RETRIES: u32 = 3;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(3000);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Lower bound on the pending-ack sweep cadence.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Immutable configuration snapshot for a client.
///
/// Created once at construction and never mutated afterwards; reconfiguring
/// means constructing a new client.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `wss://example.com/socket`
    pub endpoint: String,
    /// Reconnection strategy after an unexpected close
    pub reconnect: ReconnectConfig,
    /// Interval between liveness pings while open
    pub heartbeat_interval: Duration,
    /// Number of heartbeat intervals without a pong before the connection is presumed dead
    pub missed_beat_tolerance: u32,
    /// Maximum envelopes resident in the outbound queue
    pub queue_capacity: usize,
    /// Deadline for establishing a connection
    pub connect_timeout: Duration,
    /// Default deadline for ack-required sends; also the basis for the sweep cadence
    pub ack_timeout: Duration,
    /// Retry budget for each outbound envelope
    pub send_retries: u32,
    /// Encode frames as binary WebSocket messages instead of text.
    /// Opaque pass-through to the transport.
    pub binary_frames: bool,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_beat_tolerance: DEFAULT_MISSED_BEAT_TOLERANCE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            send_retries: DEFAULT_SEND_RETRIES,
            binary_frames: false,
        }
    }

    /// Cadence of the pending-ack expiry sweep: a tenth of the configured
    /// ack timeout, floored so that tiny timeouts cannot spin the timer.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        (self.ack_timeout / 10).max(MIN_SWEEP_INTERVAL)
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub base_interval: Duration,
    /// Cap on the exponentially growing delay
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_RECONNECT_ATTEMPTS),
            base_interval: DEFAULT_BASE_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.base_interval)
            .with_max_interval(config.max_interval)
            .with_multiplier(2.0)
            // Deterministic delays: attempt n waits min(base * 2^(n-1), max)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // Max attempts are enforced separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = ReconnectConfig {
            max_attempts: None,
            base_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(30),
        };
        let mut backoff: ExponentialBackoff = config.into();

        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(backoff.next_backoff().expect("backoff exhausted"));
        }

        assert_eq!(delays[0], Duration::from_secs(3));
        assert_eq!(delays[1], Duration::from_secs(6));
        assert_eq!(delays[2], Duration::from_secs(12));
        assert_eq!(delays[3], Duration::from_secs(24));
        assert_eq!(delays[4], Duration::from_secs(30));
        assert_eq!(delays[5], Duration::from_secs(30));
    }

    #[test]
    fn backoff_is_monotone_and_resets() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let next = backoff.next_backoff().expect("backoff exhausted");
            assert!(next >= previous, "delay must never shrink");
            assert!(next <= Duration::from_secs(30), "delay must stay capped");
            previous = next;
        }

        // A successful open resets the schedule to the base value
        backoff.reset();
        assert_eq!(
            backoff.next_backoff(),
            Some(Duration::from_millis(3000)),
            "reset must return to the base interval"
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ConnectionConfig::new("wss://example.invalid");

        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.base_interval, Duration::from_millis(3000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(!config.binary_frames);
    }

    #[test]
    fn sweep_interval_is_tenth_of_ack_timeout() {
        let mut config = ConnectionConfig::new("wss://example.invalid");
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));

        config.ack_timeout = Duration::from_millis(50);
        assert_eq!(config.sweep_interval(), MIN_SWEEP_INTERVAL);
    }
}
