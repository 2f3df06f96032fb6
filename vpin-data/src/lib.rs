#![forbid(unsafe_code)]

//! # VPIN Data
//! Volume-synchronised probability of informed trading (VPIN) computed from a live exchange trade
//! feed, fanned out to many subscribers, and replayable over historical trades.
//!
//! The library includes:
//! - [`FeedIngestor`]: reconnecting upstream trade feed state machine.
//! - [`BucketAccumulator`]: volume bucketing and rolling VPIN score.
//! - [`AlertLevel`]: severity classification and escalation tracking.
//! - [`Broadcaster`]: authoritative stream state with history replay for new subscribers.
//! - [`BacktestReplayer`]: offline replay through an isolated accumulator.
//! - [`VpinService`]: `start` / `stop` / `status` / `reset` / `run_backtest` command facade.

/// Volume bucketing and rolling VPIN computation.
pub mod accumulator;

/// Alert level classification.
pub mod alert;

/// Outbound anomaly events and the external agent seam.
pub mod anomaly;

/// Offline replay and historical trade loading.
pub mod backtest;

/// Live stream state and subscriber fan-out.
pub mod broadcast;

/// Volume buckets and the rolling bucket window.
pub mod bucket;

/// Engine and stream configuration.
pub mod config;

/// All [`Error`](std::error::Error)s generated in VPIN Data.
pub mod error;

/// Upstream trade feed ingestion.
pub mod feed;

/// Command facade over the live pipeline.
pub mod service;

/// Normalised trade.
pub mod trade;

pub use accumulator::{BucketAccumulator, BucketClose, VpinSample};
pub use alert::{AlertLevel, AlertTracker, crossed_up};
pub use backtest::{BacktestReplayer, BacktestResult, BacktestSummary};
pub use broadcast::{Broadcaster, StatusSnapshot, SubscriberMessage, Subscription};
pub use config::{EngineConfig, StreamConfig};
pub use feed::{FeedConfig, FeedIngestor, IngestorState};
pub use service::VpinService;
pub use trade::Trade;
