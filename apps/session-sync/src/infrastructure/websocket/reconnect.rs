//! Reconnection Policy
//!
//! Exponential backoff for re-dialling a realtime feed. The feed retries
//! until it is shut down, so the policy never runs out of attempts.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%). Zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// Backoff state for one reconnect sequence.
///
/// # Example
///
/// ```rust
/// use session_sync::infrastructure::websocket::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert_eq!(policy.next_delay(), Duration::from_secs(1));
/// assert_eq!(policy.next_delay(), Duration::from_secs(2));
///
/// policy.reset();
/// assert_eq!(policy.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy positioned at its first attempt.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt_count: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);
        let delay = self.jittered(self.current_delay);

        let scaled = self.current_delay.as_secs_f64() * self.config.multiplier;
        let next = if scaled.is_finite() {
            Duration::try_from_secs_f64(scaled.max(0.0)).unwrap_or(self.config.max_delay)
        } else {
            self.config.max_delay
        };
        self.current_delay = next.min(self.config.max_delay);

        delay
    }

    /// Return to the initial delay after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let base = delay.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(32));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let delays: Vec<u64> = (0..8).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(policy.attempt_count(), 8);
    }

    #[test]
    fn test_reset_returns_to_initial_delay() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            jitter_factor: 0.1,
            ..ReconnectConfig::default()
        };
        for _ in 0..50 {
            let mut policy = ReconnectPolicy::new(config);
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(899), "{delay:?}");
            assert!(delay <= Duration::from_millis(1101), "{delay:?}");
        }
    }

    #[test]
    fn test_zero_initial_delay_stays_zero() {
        let config = ReconnectConfig {
            initial_delay: Duration::ZERO,
            ..ReconnectConfig::default()
        };
        let mut policy = ReconnectPolicy::new(config);
        assert_eq!(policy.next_delay(), Duration::ZERO);
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }
}
