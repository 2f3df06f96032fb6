//! Engine and stream configuration.
//!
//! Every value has a sensible default, can be overridden with `with_*` builder setters, or read
//! from `VPIN_*` environment variables. Configuration is validated when an engine component is
//! constructed so that invalid values fail fast before any ingestion starts.

use crate::error::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{str::FromStr, time::Duration};

/// Default volume (base asset units) that fills one bucket.
pub const DEFAULT_BUCKET_VOLUME: Decimal = dec!(1.0);

/// Default number of closed buckets averaged into a VPIN score.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Default score at or above which a sample is flagged as an alert.
pub const DEFAULT_ALERT_THRESHOLD: Decimal = dec!(0.70);

/// Configuration shared by the live pipeline and the backtest replayer.
///
/// Two runs only produce identical sample series when their `EngineConfig`s are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Target volume of every bucket.
    pub bucket_volume: Decimal,
    /// Number of closed buckets in the rolling window.
    pub window_size: usize,
    /// Score at or above which [`VpinSample::alert`](crate::accumulator::VpinSample) is set.
    pub alert_threshold: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_volume: DEFAULT_BUCKET_VOLUME,
            window_size: DEFAULT_WINDOW_SIZE,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn with_bucket_volume(mut self, volume: Decimal) -> Self {
        self.bucket_volume = volume;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: Decimal) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_volume <= Decimal::ZERO {
            return Err(ConfigError::BucketVolume(self.bucket_volume.to_string()));
        }
        if self.window_size == 0 {
            return Err(ConfigError::WindowSize);
        }
        if self.alert_threshold < Decimal::ZERO || self.alert_threshold > Decimal::ONE {
            return Err(ConfigError::AlertThreshold(self.alert_threshold.to_string()));
        }
        Ok(())
    }

    /// Construct from `VPIN_BUCKET_VOLUME`, `VPIN_WINDOW_SIZE` and `VPIN_ALERT_THRESHOLD`,
    /// falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Construct from an arbitrary key lookup, validating the result.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            bucket_volume: parse_or(&lookup, "VPIN_BUCKET_VOLUME", defaults.bucket_volume)?,
            window_size: parse_or(&lookup, "VPIN_WINDOW_SIZE", defaults.window_size)?,
            alert_threshold: parse_or(&lookup, "VPIN_ALERT_THRESHOLD", defaults.alert_threshold)?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration of the live stream state and its outbound queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Maximum number of samples retained for replay to new subscribers.
    pub history_capacity: usize,
    /// Per-subscriber send queue capacity; a subscriber with a full queue is dropped.
    pub subscriber_queue: usize,
    /// Capacity of the outbound anomaly queue; events are dropped when it is full.
    pub anomaly_queue: usize,
    /// Upper bound on a single agent investigation.
    pub agent_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            history_capacity: 200,
            subscriber_queue: 256,
            anomaly_queue: 16,
            agent_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_subscriber_queue(mut self, capacity: usize) -> Self {
        self.subscriber_queue = capacity;
        self
    }

    pub fn with_anomaly_queue(mut self, capacity: usize) -> Self {
        self.anomaly_queue = capacity;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::HistoryCapacity);
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::QueueCapacity("subscribers"));
        }
        if self.anomaly_queue == 0 {
            return Err(ConfigError::QueueCapacity("anomalies"));
        }
        Ok(())
    }

    /// Construct from `VPIN_HISTORY_CAPACITY`, `VPIN_SUBSCRIBER_QUEUE`, `VPIN_ANOMALY_QUEUE` and
    /// `VPIN_AGENT_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            history_capacity: parse_or(&lookup, "VPIN_HISTORY_CAPACITY", defaults.history_capacity)?,
            subscriber_queue: parse_or(&lookup, "VPIN_SUBSCRIBER_QUEUE", defaults.subscriber_queue)?,
            anomaly_queue: parse_or(&lookup, "VPIN_ANOMALY_QUEUE", defaults.anomaly_queue)?,
            agent_timeout: Duration::from_secs(parse_or(
                &lookup,
                "VPIN_AGENT_TIMEOUT_SECS",
                defaults.agent_timeout.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> = pairs
            .iter()
            .map(|(key, value)| (*key, value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_engine_config_validate() {
        struct TestCase {
            input: EngineConfig,
            expected: Result<(), ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: defaults are valid
                input: EngineConfig::default(),
                expected: Ok(()),
            },
            TestCase {
                // TC1: zero bucket volume
                input: EngineConfig::default().with_bucket_volume(Decimal::ZERO),
                expected: Err(ConfigError::BucketVolume("0".to_string())),
            },
            TestCase {
                // TC2: negative bucket volume
                input: EngineConfig::default().with_bucket_volume(dec!(-1.5)),
                expected: Err(ConfigError::BucketVolume("-1.5".to_string())),
            },
            TestCase {
                // TC3: empty rolling window
                input: EngineConfig::default().with_window_size(0),
                expected: Err(ConfigError::WindowSize),
            },
            TestCase {
                // TC4: alert threshold above 1
                input: EngineConfig::default().with_alert_threshold(dec!(1.2)),
                expected: Err(ConfigError::AlertThreshold("1.2".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_engine_config_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("VPIN_BUCKET_VOLUME", "5.0"),
            ("VPIN_WINDOW_SIZE", " 20 "),
        ]))
        .unwrap();

        assert_eq!(config.bucket_volume, dec!(5.0));
        assert_eq!(config.window_size, 20);
        assert_eq!(config.alert_threshold, DEFAULT_ALERT_THRESHOLD);

        let error = EngineConfig::from_lookup(lookup_from(&[("VPIN_WINDOW_SIZE", "fifty")]));
        assert_eq!(
            error,
            Err(ConfigError::Env {
                key: "VPIN_WINDOW_SIZE",
                value: "fifty".to_string()
            })
        );

        let error = EngineConfig::from_lookup(lookup_from(&[("VPIN_WINDOW_SIZE", "0")]));
        assert_eq!(error, Err(ConfigError::WindowSize));
    }

    #[test]
    fn test_stream_config_from_lookup() {
        let config = StreamConfig::from_lookup(lookup_from(&[
            ("VPIN_HISTORY_CAPACITY", "100"),
            ("VPIN_AGENT_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.subscriber_queue, 256);
        assert_eq!(config.agent_timeout, Duration::from_secs(5));

        let error = StreamConfig::from_lookup(lookup_from(&[("VPIN_SUBSCRIBER_QUEUE", "0")]));
        assert_eq!(error, Err(ConfigError::QueueCapacity("subscribers")));
    }
}
