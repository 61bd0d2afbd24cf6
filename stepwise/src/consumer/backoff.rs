//! Poll backoff for lazy consumers.
//!
//! A lazy consumer sleeps before each poll cycle. The sleep grows with each
//! consecutive empty cycle and resets once a batch carries messages.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows across idle cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^idle
    Exponential,
    /// delay = base * (idle + 1)
    Linear,
    /// delay = base
    #[default]
    Constant,
}

/// Randomisation applied to the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for lazy polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBackoffConfig {
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for PollBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Constant,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl PollBackoffConfig {
    /// Creates a constant backoff of the given delay.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_delay_ms: ms,
            max_delay_ms: ms,
            ..Self::default()
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Idle-cycle tracking for a lazy consumer.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    config: PollBackoffConfig,
    idle_cycles: u32,
}

impl PollBackoff {
    /// Creates a backoff with no idle cycles recorded.
    #[must_use]
    pub fn new(config: PollBackoffConfig) -> Self {
        Self { config, idle_cycles: 0 }
    }

    /// Returns the number of consecutive empty cycles.
    #[must_use]
    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles
    }

    /// Records an empty poll.
    pub fn record_idle(&mut self) {
        self.idle_cycles = self.idle_cycles.saturating_add(1);
    }

    /// Records a poll that returned messages.
    pub fn reset(&mut self) {
        self.idle_cycles = 0;
    }

    /// Un-jittered delay for the current idle count.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let base = self.config.base_delay_ms;
        let max = self.config.max_delay_ms;
        let delay = match self.config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(self.idle_cycles)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(self.idle_cycles) + 1),
            BackoffStrategy::Constant => base,
        };
        Duration::from_millis(delay.min(max))
    }

    /// Delay to sleep before the next poll.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let delay = u64::try_from(self.base_delay().as_millis()).unwrap_or(u64::MAX);
        let jittered = match self.config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_backoff_ignores_idle_cycles() {
        let mut backoff = PollBackoff::new(PollBackoffConfig::constant(Duration::from_millis(250)));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        backoff.record_idle();
        backoff.record_idle();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let config = PollBackoffConfig::default()
            .with_base_delay_ms(100)
            .with_max_delay_ms(500)
            .with_backoff(BackoffStrategy::Exponential);
        let mut backoff = PollBackoff::new(config);

        let mut delays = Vec::new();
        for _ in 0..4 {
            delays.push(backoff.base_delay().as_millis());
            backoff.record_idle();
        }
        assert_eq!(delays, vec![100, 200, 400, 500]);
    }

    #[test]
    fn test_linear_backoff() {
        let config = PollBackoffConfig::default()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        let mut backoff = PollBackoff::new(config);
        backoff.record_idle();
        backoff.record_idle();
        assert_eq!(backoff.base_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_reset_after_messages() {
        let config = PollBackoffConfig::default()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);
        let mut backoff = PollBackoff::new(config);
        backoff.record_idle();
        backoff.record_idle();
        backoff.reset();
        assert_eq!(backoff.idle_cycles(), 0);
        assert_eq!(backoff.base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let full = PollBackoff::new(
            PollBackoffConfig::constant(Duration::from_millis(100)).with_jitter(JitterStrategy::Full),
        );
        let equal = PollBackoff::new(
            PollBackoffConfig::constant(Duration::from_millis(100)).with_jitter(JitterStrategy::Equal),
        );
        for _ in 0..50 {
            assert!(full.next_delay() <= Duration::from_millis(100));
            let d = equal.next_delay();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: PollBackoffConfig = serde_json::from_str(r#"{"backoff_strategy": "exponential"}"#).unwrap();
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
    }
}
