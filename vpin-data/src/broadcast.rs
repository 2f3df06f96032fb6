//! Authoritative live stream state and fan-out to subscribers.
//!
//! The [`Broadcaster`] is the only owner of [`StreamState`]. Samples enter through a single
//! writer (the ingestion task), and every subscriber holds a bounded queue that is fed with
//! `try_send`, so a slow or dead subscriber is dropped instead of stalling the writer.

use crate::{accumulator::VpinSample, config::StreamConfig, feed::IngestorState, trade::Trade};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Unique identifier of a registered subscriber.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct SubscriberId(pub u64);

/// Messages delivered to subscribers, in the JSON shape `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SubscriberMessage {
    /// Full current history, sent once on subscribe before any live update.
    History(Vec<VpinSample>),
    VpinUpdate(VpinSample),
    SystemReset(StatusSnapshot),
    /// Opaque payload produced by the anomaly agent collaborator.
    IntelligenceBrief(serde_json::Value),
}

/// Process-wide live stream state.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub is_streaming: bool,
    pub ingestor_state: IngestorState,
    pub history: VecDeque<VpinSample>,
    pub history_capacity: usize,
    pub latest: Option<VpinSample>,
    pub latest_price: Option<Decimal>,
    pub latest_brief: Option<serde_json::Value>,
    pub total_trades_processed: u64,
    pub malformed_messages: u64,
    pub disconnects: u64,
}

impl StreamState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            is_streaming: false,
            ingestor_state: IngestorState::Disconnected,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            latest: None,
            latest_price: None,
            latest_brief: None,
            total_trades_processed: 0,
            malformed_messages: 0,
            disconnects: 0,
        }
    }

    fn push_sample(&mut self, sample: VpinSample) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        self.latest = Some(sample);
    }
}

/// Immutable point-in-time view of [`StreamState`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusSnapshot {
    pub streaming: bool,
    pub ingestor_state: IngestorState,
    pub latest: Option<VpinSample>,
    pub current_vpin: Option<Decimal>,
    pub latest_price: Option<Decimal>,
    pub trade_count: u64,
    pub history_len: usize,
    pub connected_clients: usize,
    pub malformed_messages: u64,
    pub disconnects: u64,
}

/// A registered subscriber's receiving half.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<SubscriberMessage>,
}

#[derive(Debug)]
struct Inner {
    state: StreamState,
    subscribers: FnvHashMap<SubscriberId, mpsc::Sender<SubscriberMessage>>,
    next_id: u64,
    /// Incremented by every reset.
    generation: u64,
}

impl Inner {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            streaming: self.state.is_streaming,
            ingestor_state: self.state.ingestor_state,
            latest: self.state.latest.clone(),
            current_vpin: self.state.latest.as_ref().map(|sample| sample.vpin),
            latest_price: self.state.latest_price,
            trade_count: self.state.total_trades_processed,
            history_len: self.state.history.len(),
            connected_clients: self.subscribers.len(),
            malformed_messages: self.state.malformed_messages,
            disconnects: self.state.disconnects,
        }
    }

    /// Deliver to every subscriber, dropping those whose queue is full or closed.
    fn fan_out(&mut self, message: &SubscriberMessage) -> usize {
        let mut dropped = Vec::new();
        for (id, sender) in &self.subscribers {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber queue full, dropping subscriber");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "subscriber closed, removing");
                    dropped.push(*id);
                }
            }
        }
        for id in &dropped {
            self.subscribers.remove(id);
        }
        self.subscribers.len()
    }
}

/// Cheaply cloneable handle to the single live [`StreamState`] and its subscriber set.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
    subscriber_queue: usize,
}

impl Broadcaster {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: StreamState::new(config.history_capacity),
                subscribers: FnvHashMap::default(),
                next_id: 0,
                generation: 0,
            })),
            subscriber_queue: config.subscriber_queue.max(1),
        }
    }

    /// Append a sample to history and push it to every subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn on_sample(&self, sample: VpinSample) -> usize {
        let mut inner = self.inner.lock();
        inner.state.push_sample(sample.clone());
        inner.fan_out(&SubscriberMessage::VpinUpdate(sample))
    }

    /// Register a new subscriber with its own bounded queue and replay the current history.
    ///
    /// Returns `None` if the replay could not be enqueued, in which case nothing is registered.
    pub fn on_subscribe(&self) -> Option<Subscription> {
        let (sender, receiver) = mpsc::channel(self.subscriber_queue);
        self.register(sender).map(|id| Subscription { id, receiver })
    }

    /// Register an externally created queue. The history replay is enqueued while the state
    /// lock is held, so it always precedes the first live sample.
    ///
    /// Returns `None` without registering if the queue cannot accept the replay.
    pub fn register(&self, sender: mpsc::Sender<SubscriberMessage>) -> Option<SubscriberId> {
        let mut inner = self.inner.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;

        let replay = SubscriberMessage::History(inner.state.history.iter().cloned().collect());
        match sender.try_send(replay) {
            Ok(()) => {
                inner.subscribers.insert(id, sender);
                info!(subscriber = %id, total = inner.subscribers.len(), "subscriber connected");
                Some(id)
            }
            Err(error) => {
                warn!(subscriber = %id, %error, "failed to replay history, subscriber not registered");
                None
            }
        }
    }

    /// Remove a subscriber. Unknown or already removed ids are ignored.
    pub fn on_unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = %id, total = inner.subscribers.len(), "subscriber disconnected");
        }
        removed
    }

    /// Clear history and counters, mark the stream idle and notify every subscriber. Subscribers
    /// remain registered.
    pub fn reset(&self) -> StatusSnapshot {
        let mut inner = self.inner.lock();
        let capacity = inner.state.history_capacity;
        inner.state = StreamState::new(capacity);
        inner.generation += 1;
        let snapshot = inner.snapshot();
        inner.fan_out(&SubscriberMessage::SystemReset(snapshot.clone()));
        info!("stream state reset");
        snapshot
    }

    /// Reset generation of the current stream state.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Store and fan out an agent brief produced for an event of `generation`.
    ///
    /// Returns `None` and discards the brief if a reset happened since, otherwise the number of
    /// subscribers that received it.
    pub fn publish_brief(&self, generation: u64, brief: serde_json::Value) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(
                generation,
                current = inner.generation,
                "discarding brief from before reset"
            );
            return None;
        }
        inner.state.latest_brief = Some(brief.clone());
        Some(inner.fan_out(&SubscriberMessage::IntelligenceBrief(brief)))
    }

    pub fn record_trade(&self, trade: &Trade) {
        let mut inner = self.inner.lock();
        inner.state.total_trades_processed += 1;
        inner.state.latest_price = Some(trade.price());
    }

    pub fn record_malformed(&self) {
        self.inner.lock().state.malformed_messages += 1;
    }

    pub fn set_ingestor_state(&self, state: IngestorState) {
        let mut inner = self.inner.lock();
        if inner.state.ingestor_state == IngestorState::Streaming
            && state == IngestorState::Disconnected
        {
            inner.state.disconnects += 1;
        }
        inner.state.ingestor_state = state;
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.inner.lock().state.is_streaming = streaming;
    }

    /// Snapshot of the current state. Never mutates it.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.lock().snapshot()
    }

    /// Up to `n` most recent samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<VpinSample> {
        let inner = self.inner.lock();
        let skip = inner.state.history.len().saturating_sub(n);
        inner.state.history.iter().skip(skip).cloned().collect()
    }

    pub fn latest_brief(&self) -> Option<serde_json::Value> {
        self.inner.lock().state.latest_brief.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
