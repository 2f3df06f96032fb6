//! Offline replay of a historical trade sequence through an isolated accumulator.

use crate::{
    accumulator::{BucketAccumulator, VpinSample},
    alert::AlertTracker,
    config::EngineConfig,
    error::ConfigError,
    trade::Trade,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Binance REST historical trade loader.
pub mod history;

/// Aggregate statistics of a single replay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BacktestSummary {
    pub trades: u64,
    pub buckets_closed: u64,
    pub samples: usize,
    pub peak_vpin: Option<Decimal>,
    /// Timestamp of the first sample reaching `peak_vpin`.
    pub peak_at: Option<DateTime<Utc>>,
    pub first_alert_at: Option<DateTime<Utc>>,
    pub first_alert_vpin: Option<Decimal>,
    /// Number of upward alert level crossings.
    pub escalations: u64,
}

impl BacktestSummary {
    fn observe(&mut self, sample: &VpinSample) {
        self.samples += 1;

        if self.peak_vpin.is_none_or(|peak| sample.vpin > peak) {
            self.peak_vpin = Some(sample.vpin);
            self.peak_at = Some(sample.observed_at);
        }

        if sample.alert && self.first_alert_at.is_none() {
            self.first_alert_at = Some(sample.observed_at);
            self.first_alert_vpin = Some(sample.vpin);
        }
    }
}

/// Every sample produced by a replay, in order, plus its [`BacktestSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BacktestResult {
    pub samples: Vec<VpinSample>,
    pub summary: BacktestSummary,
}

/// Replays trades through a fresh [`BucketAccumulator`] per run. Never touches live state, and
/// produces exactly the samples the live pipeline would for the same trades and configuration.
#[derive(Debug, Clone)]
pub struct BacktestReplayer {
    template: BucketAccumulator,
}

impl BacktestReplayer {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            template: BucketAccumulator::new(config)?,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.template.config()
    }

    pub fn run<'a, Iter>(&self, trades: Iter) -> BacktestResult
    where
        Iter: IntoIterator<Item = &'a Trade>,
    {
        let mut accumulator = self.template.clone();
        let mut alerts = AlertTracker::new();
        let mut summary = BacktestSummary::default();
        let mut samples = Vec::new();

        for trade in trades {
            for sample in accumulator
                .ingest(trade)
                .into_iter()
                .filter_map(|close| close.sample)
            {
                if alerts.observe(sample.alert_level).is_some() {
                    summary.escalations += 1;
                }
                summary.observe(&sample);
                samples.push(sample);
            }
        }

        summary.trades = accumulator.trades();
        summary.buckets_closed = accumulator.buckets_closed();

        info!(
            trades = summary.trades,
            buckets = summary.buckets_closed,
            samples = summary.samples,
            peak_vpin = ?summary.peak_vpin,
            escalations = summary.escalations,
            "backtest complete"
        );

        BacktestResult { samples, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertLevel;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn time(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_667_822_400 + seconds, 0).unwrap()
    }

    fn trade(seconds: i64, quantity: Decimal, is_buy: bool) -> Trade {
        Trade::new(dec!(20000) + Decimal::from(seconds), quantity, time(seconds), is_buy).unwrap()
    }

    fn replayer() -> BacktestReplayer {
        BacktestReplayer::new(
            EngineConfig::default()
                .with_bucket_volume(dec!(1))
                .with_window_size(2)
                .with_alert_threshold(dec!(0.70)),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_replay() {
        let result = replayer().run(&Vec::<Trade>::new());
        assert_eq!(result.samples, vec![]);
        assert_eq!(result.summary, BacktestSummary::default());
    }

    #[test]
    fn test_summary_tracks_peak_alert_and_escalations() {
        let trades = vec![
            // Balanced buckets 1 and 2
            trade(0, dec!(0.5), true),
            trade(1, dec!(0.5), false),
            trade(2, dec!(0.5), true),
            trade(3, dec!(0.5), false),
            // All buy buckets 3 and 4 from a single split trade
            trade(4, dec!(2), true),
            // Balanced bucket 5
            trade(5, dec!(0.5), true),
            trade(6, dec!(0.5), false),
        ];

        let result = replayer().run(&trades);

        assert_eq!(
            result
                .samples
                .iter()
                .map(|sample| (sample.bucket_id, sample.vpin, sample.alert_level))
                .collect::<Vec<_>>(),
            vec![
                (2, dec!(0), AlertLevel::Normal),
                (3, dec!(0.5), AlertLevel::Moderate),
                (4, dec!(1), AlertLevel::Critical),
                (5, dec!(0.5), AlertLevel::Moderate),
            ]
        );

        assert_eq!(
            result.summary,
            BacktestSummary {
                trades: 7,
                buckets_closed: 5,
                samples: 4,
                peak_vpin: Some(dec!(1)),
                peak_at: Some(time(4)),
                first_alert_at: Some(time(4)),
                first_alert_vpin: Some(dec!(1)),
                escalations: 2,
            }
        );
    }

    #[test]
    fn test_runs_are_isolated() {
        let replayer = replayer();
        let trades = (0..10)
            .map(|seconds| trade(seconds, dec!(0.7), seconds % 3 == 0))
            .collect::<Vec<_>>();

        let first = replayer.run(&trades);
        let second = replayer.run(&trades);
        assert_eq!(first, second);
        assert_eq!(first.summary.trades, 10);
    }
}
