//! Volume bucket accumulation and rolling VPIN computation.
//!
//! VPIN follows Easley, López de Prado & O'Hara (2012), "Flow Toxicity and Liquidity in a High
//! Frequency World": trades are grouped into buckets of equal volume rather than equal time, and
//! the score is the mean absolute order imbalance over the most recent `window_size` buckets.

use crate::{
    alert::AlertLevel,
    bucket::{RollingWindow, VolumeBucket},
    config::EngineConfig,
    error::ConfigError,
    trade::Trade,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// VPIN reading produced whenever a bucket closes on a full rolling window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VpinSample {
    /// Timestamp of the trade that closed the bucket.
    pub observed_at: DateTime<Utc>,
    pub vpin: Decimal,
    pub alert_level: AlertLevel,
    /// Score is at or above the configured alert threshold.
    pub alert: bool,
    pub bucket_id: u64,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// Buyer initiated share of the closed bucket.
    pub order_imbalance: Decimal,
    pub latest_price: Decimal,
    /// Trades ingested by the accumulator up to and including the closing trade.
    pub trade_count: u64,
}

/// A bucket closed by an ingested trade, with the sample computed at that point if the rolling
/// window was full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketClose {
    pub bucket: VolumeBucket,
    pub sample: Option<VpinSample>,
}

/// Deterministic, I/O free bucket accumulator.
///
/// Each instance is fully isolated, so the live pipeline and a backtest replay can run their own
/// accumulators side by side.
#[derive(Debug, Clone)]
pub struct BucketAccumulator {
    config: EngineConfig,
    window: RollingWindow,
    current: Option<VolumeBucket>,
    next_bucket_id: u64,
    buckets_closed: u64,
    trades: u64,
    latest_price: Option<Decimal>,
}

impl BucketAccumulator {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            window: RollingWindow::new(config.window_size),
            config,
            current: None,
            next_bucket_id: 1,
            buckets_closed: 0,
            trades: 0,
            latest_price: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Classify the trade by its aggressor flag and spread its quantity across as many buckets as
    /// it fills. Returns every bucket closed by this trade, in closing order.
    pub fn ingest(&mut self, trade: &Trade) -> Vec<BucketClose> {
        self.trades += 1;
        self.latest_price = Some(trade.price());

        let is_buy = trade.is_buyer_aggressor();
        let mut remaining = trade.quantity();
        let mut closes = Vec::new();

        while remaining > Decimal::ZERO {
            let mut bucket = match self.current.take() {
                Some(bucket) => bucket,
                None => self.open_bucket(trade.occurred_at()),
            };

            remaining = bucket.fill(remaining, is_buy);

            if bucket.is_full() {
                bucket.closed_at = Some(trade.occurred_at());
                closes.push(self.close_bucket(bucket, trade));
            } else {
                self.current = Some(bucket);
            }
        }

        closes
    }

    fn open_bucket(&mut self, started_at: DateTime<Utc>) -> VolumeBucket {
        let id = self.next_bucket_id;
        self.next_bucket_id += 1;
        VolumeBucket::new(id, self.config.bucket_volume, started_at)
    }

    fn close_bucket(&mut self, bucket: VolumeBucket, trade: &Trade) -> BucketClose {
        self.buckets_closed += 1;
        self.window.push(bucket.clone());

        let sample = self.window.vpin().map(|vpin| VpinSample {
            observed_at: trade.occurred_at(),
            vpin,
            alert_level: AlertLevel::classify(vpin),
            alert: vpin >= self.config.alert_threshold,
            bucket_id: bucket.id,
            buy_volume: bucket.buy_volume,
            sell_volume: bucket.sell_volume,
            order_imbalance: bucket.buy_ratio(),
            latest_price: trade.price(),
            trade_count: self.trades,
        });

        BucketClose { bucket, sample }
    }

    /// Bucket currently being filled, if any volume has arrived since the last close.
    pub fn current_bucket(&self) -> Option<&VolumeBucket> {
        self.current.as_ref()
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn buckets_closed(&self) -> u64 {
        self.buckets_closed
    }

    pub fn trades(&self) -> u64 {
        self.trades
    }

    pub fn latest_price(&self) -> Option<Decimal> {
        self.latest_price
    }

    /// Most recent VPIN score, `None` until the rolling window is full.
    pub fn current_vpin(&self) -> Option<Decimal> {
        self.window.vpin()
    }
}
