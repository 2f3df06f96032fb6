use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-volume accumulation window.
///
/// While open, `buy_volume + sell_volume <= target_volume`. The bucket is closed exactly when
/// the two sum to `target_volume`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeBucket {
    pub id: u64,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub target_volume: Decimal,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub trade_count: u64,
}

impl VolumeBucket {
    pub fn new(id: u64, target_volume: Decimal, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            target_volume,
            started_at,
            closed_at: None,
            trade_count: 0,
        }
    }

    pub fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    pub fn remaining(&self) -> Decimal {
        self.target_volume - self.total_volume()
    }

    pub fn is_full(&self) -> bool {
        self.total_volume() == self.target_volume
    }

    /// Add up to the remaining capacity of `volume` to the bucket, returning the unfilled part.
    pub fn fill(&mut self, volume: Decimal, is_buy: bool) -> Decimal {
        let filled = volume.min(self.remaining());
        if is_buy {
            self.buy_volume += filled;
        } else {
            self.sell_volume += filled;
        }
        self.trade_count += 1;
        volume - filled
    }

    /// `|buy - sell| / (buy + sell)`, the bucket's contribution to VPIN.
    pub fn imbalance(&self) -> Decimal {
        let total = self.total_volume();
        if total.is_zero() {
            return Decimal::ZERO;
        }
        (self.buy_volume - self.sell_volume).abs() / total
    }

    /// Share of bucket volume that was buyer initiated, `0.5` for an empty bucket.
    pub fn buy_ratio(&self) -> Decimal {
        let total = self.total_volume();
        if total.is_zero() {
            return dec!(0.5);
        }
        self.buy_volume / total
    }
}

/// FIFO sequence of the most recent closed buckets.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    buckets: VecDeque<VolumeBucket>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a closed bucket, returning the evicted oldest bucket if the window was full.
    pub fn push(&mut self, bucket: VolumeBucket) -> Option<VolumeBucket> {
        let evicted = if self.buckets.len() >= self.capacity {
            self.buckets.pop_front()
        } else {
            None
        };
        self.buckets.push_back(bucket);
        evicted
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buckets.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeBucket> {
        self.buckets.iter()
    }

    /// Mean bucket imbalance, defined only once the window holds `capacity` buckets.
    pub fn vpin(&self) -> Option<Decimal> {
        if !self.is_full() {
            return None;
        }
        let sum: Decimal = self.buckets.iter().map(VolumeBucket::imbalance).sum();
        Some(sum / Decimal::from(self.buckets.len()))
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
