use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Reconnection delay policy used by the [`FeedIngestor`](super::FeedIngestor).
///
/// `attempt` is zero for the first retry after a disconnect and increments on every consecutive
/// failure until a connection reaches `Streaming` again.
pub trait Backoff: Send {
    fn next_delay(&mut self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter, capped at a ceiling.
///
/// The undelayed exponential is `base * 2^attempt`, clamped to `ceiling`. A random share of up to
/// `jitter` of that value is then subtracted, so delays never exceed the ceiling and concurrent
/// reconnects do not synchronise.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
    jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Result<Self, ConfigError> {
        if ceiling < base || base.is_zero() {
            return Err(ConfigError::Backoff {
                base_ms: base.as_millis() as u64,
                ceiling_ms: ceiling.as_millis() as u64,
            });
        }
        Ok(Self {
            base,
            ceiling,
            ..Self::default()
        })
    }

    /// Fraction of each delay that may be randomly shaved off, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before jitter is applied.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.ceiling)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Duration {
        let exponential = self.exponential(attempt);
        let max_jitter_ms = (exponential.as_millis() as f64 * self.jitter) as u64;
        if max_jitter_ms == 0 {
            return exponential;
        }
        let jitter_ms = rand::rng().random_range(0..=max_jitter_ms);
        exponential.saturating_sub(Duration::from_millis(jitter_ms))
    }
}
