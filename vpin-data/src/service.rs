//! Command facade over the live pipeline.
//!
//! Exactly one ingestion task owns the [`LivePipeline`] while streaming. The pipeline is moved
//! into the task on [`VpinService::start`] and handed back when the task joins on
//! [`VpinService::stop`], so accumulator state survives a stop/start cycle and is only replaced
//! by [`VpinService::reset`].

use crate::{
    accumulator::BucketAccumulator,
    alert::AlertTracker,
    anomaly::{ANOMALY_CONTEXT_LEN, AnomalyEvent, AnomalyPublisher},
    backtest::{BacktestReplayer, BacktestResult},
    broadcast::{Broadcaster, StatusSnapshot},
    config::EngineConfig,
    error::{ConfigError, DecodeError},
    feed::{
        FeedConfig, FeedHandler, FeedIngestor, IngestorState,
        backoff::{Backoff, ExponentialBackoff},
        binance::FeedFormat,
        source::{TradeSource, WebSocketSource},
    },
    trade::Trade,
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Single writer state of the live stream: accumulator, alert tracker and anomaly publisher.
#[derive(Debug)]
pub struct LivePipeline {
    accumulator: BucketAccumulator,
    alerts: AlertTracker,
    broadcaster: Broadcaster,
    anomalies: AnomalyPublisher,
}

impl LivePipeline {
    pub fn new(
        accumulator: BucketAccumulator,
        broadcaster: Broadcaster,
        anomalies: AnomalyPublisher,
    ) -> Self {
        Self {
            accumulator,
            alerts: AlertTracker::new(),
            broadcaster,
            anomalies,
        }
    }

    pub fn accumulator(&self) -> &BucketAccumulator {
        &self.accumulator
    }
}

impl FeedHandler for LivePipeline {
    fn on_trade(&mut self, trade: Trade) {
        self.broadcaster.record_trade(&trade);

        for close in self.accumulator.ingest(&trade) {
            debug!(
                bucket_id = close.bucket.id,
                buy_volume = %close.bucket.buy_volume,
                sell_volume = %close.bucket.sell_volume,
                "volume bucket closed"
            );

            let Some(sample) = close.sample else {
                continue;
            };

            let escalation = self.alerts.observe(sample.alert_level);
            self.broadcaster.on_sample(sample.clone());

            if let Some(escalation) = escalation {
                info!(
                    previous = %escalation.previous,
                    current = %escalation.current,
                    vpin = %sample.vpin,
                    "alert level escalated"
                );
                self.anomalies.publish(AnomalyEvent {
                    previous: escalation.previous,
                    current: escalation.current,
                    context: self.broadcaster.recent(ANOMALY_CONTEXT_LEN),
                    sample,
                    generation: self.broadcaster.generation(),
                });
            }
        }
    }

    fn on_state(&mut self, state: IngestorState) {
        self.broadcaster.set_ingestor_state(state);
    }

    fn on_malformed(&mut self, _: &DecodeError) {
        self.broadcaster.record_malformed();
    }
}

#[derive(Debug)]
enum Runner {
    Idle(LivePipeline),
    Running {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<LivePipeline>,
    },
}

/// Entry point for the `start`, `stop`, `status`, `reset` and `run_backtest` commands.
///
/// Commands that change the ingestion task serialise on an internal lock, so concurrent callers
/// never observe a half started or half stopped stream.
#[derive(Debug)]
pub struct VpinService<Source, Policy> {
    source: Arc<Source>,
    backoff: Policy,
    format: FeedFormat,
    template: BucketAccumulator,
    replayer: BacktestReplayer,
    broadcaster: Broadcaster,
    anomalies: AnomalyPublisher,
    runner: Mutex<Runner>,
}

impl VpinService<WebSocketSource, ExponentialBackoff> {
    /// Construct a service streaming from the configured WebSocket feed.
    pub fn from_feed_config(
        feed: &FeedConfig,
        engine: EngineConfig,
        broadcaster: Broadcaster,
    ) -> Result<Self, ConfigError> {
        feed.validate()?;
        Ok(Self::new(feed.source(), feed.backoff()?, engine, broadcaster)?.with_format(feed.format))
    }
}

impl<Source, Policy> VpinService<Source, Policy>
where
    Source: TradeSource + 'static,
    Policy: Backoff + Clone + 'static,
{
    pub fn new(
        source: Source,
        backoff: Policy,
        engine: EngineConfig,
        broadcaster: Broadcaster,
    ) -> Result<Self, ConfigError> {
        let template = BucketAccumulator::new(engine.clone())?;
        let replayer = BacktestReplayer::new(engine)?;
        let anomalies = AnomalyPublisher::disabled();
        let pipeline = LivePipeline::new(template.clone(), broadcaster.clone(), anomalies.clone());

        Ok(Self {
            source: Arc::new(source),
            backoff,
            format: FeedFormat::default(),
            template,
            replayer,
            broadcaster,
            anomalies,
            runner: Mutex::new(Runner::Idle(pipeline)),
        })
    }

    pub fn with_format(mut self, format: FeedFormat) -> Self {
        self.format = format;
        self
    }

    /// Route escalations to `anomalies`. Replaces the idle pipeline, so call before `start`.
    pub fn with_anomalies(mut self, anomalies: AnomalyPublisher) -> Self {
        self.anomalies = anomalies;
        *self.runner.get_mut() = Runner::Idle(self.fresh_pipeline());
        self
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start live ingestion. Returns false if it is already running.
    pub async fn start(&self) -> bool {
        let mut runner = self.runner.lock().await;
        if let Runner::Running { handle, .. } = &*runner {
            if !handle.is_finished() {
                debug!("start ignored, live stream already running");
                return false;
            }
        }

        let pipeline = self.take_pipeline(&mut runner).await;
        *runner = self.spawn(pipeline);
        true
    }

    /// Stop live ingestion, keeping accumulator state. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let mut runner = self.runner.lock().await;
        if matches!(&*runner, Runner::Idle(_)) {
            debug!("stop ignored, live stream not running");
            return false;
        }

        let pipeline = self.take_pipeline(&mut runner).await;
        *runner = Runner::Idle(pipeline);
        self.broadcaster.set_streaming(false);
        info!("live stream stopped");
        true
    }

    /// Current stream status. Never mutates state.
    pub fn status(&self) -> StatusSnapshot {
        self.broadcaster.status()
    }

    /// Stop ingestion if running, discard all accumulated state and notify subscribers. Resumes
    /// ingestion with a fresh pipeline when `resume_streaming` is set.
    pub async fn reset(&self, resume_streaming: bool) -> StatusSnapshot {
        let mut runner = self.runner.lock().await;
        let _discarded = self.take_pipeline(&mut runner).await;

        self.broadcaster.reset();
        let pipeline = self.fresh_pipeline();

        *runner = if resume_streaming {
            self.spawn(pipeline)
        } else {
            Runner::Idle(pipeline)
        };

        self.broadcaster.status()
    }

    /// Replay `trades` through an isolated accumulator. Never touches live state.
    pub fn run_backtest(&self, trades: &[Trade]) -> BacktestResult {
        self.replayer.run(trades)
    }

    fn fresh_pipeline(&self) -> LivePipeline {
        LivePipeline::new(
            self.template.clone(),
            self.broadcaster.clone(),
            self.anomalies.clone(),
        )
    }

    fn spawn(&self, mut pipeline: LivePipeline) -> Runner {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut ingestor =
            FeedIngestor::new(Arc::clone(&self.source), self.backoff.clone(), self.format);

        self.broadcaster.set_streaming(true);
        let handle = tokio::spawn(async move {
            ingestor.run(&mut pipeline, &mut shutdown_rx).await;
            pipeline
        });

        info!(format = %self.format, "live stream started");
        Runner::Running { shutdown, handle }
    }

    /// Take ownership of the pipeline, signalling and joining the ingestion task if one exists.
    /// Leaves a fresh idle pipeline in `runner`.
    async fn take_pipeline(&self, runner: &mut Runner) -> LivePipeline {
        match std::mem::replace(runner, Runner::Idle(self.fresh_pipeline())) {
            Runner::Idle(pipeline) => pipeline,
            Runner::Running { shutdown, handle } => {
                // Receiver is gone only if the task already finished
                let _ = shutdown.send(true);
                match handle.await {
                    Ok(pipeline) => pipeline,
                    Err(join_error) => {
                        error!(%join_error, "ingestion task failed, replacing live pipeline");
                        self.broadcaster.set_ingestor_state(IngestorState::Stopped);
                        self.fresh_pipeline()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alert::AlertLevel,
        broadcast::{SubscriberMessage, Subscription},
        config::StreamConfig,
        error::FeedError,
        feed::source::FrameStream,
    };
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use parking_lot::Mutex as SyncMutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    /// Yields one scripted batch of frames per connection, then idles.
    struct ScriptedSource {
        connections: SyncMutex<VecDeque<Vec<String>>>,
    }

    impl ScriptedSource {
        fn new(connections: Vec<Vec<String>>) -> Self {
            Self {
                connections: SyncMutex::new(connections.into()),
            }
        }
    }

    #[async_trait]
    impl TradeSource for ScriptedSource {
        async fn connect(&self) -> Result<FrameStream, FeedError> {
            let frames = self.connections.lock().pop_front().unwrap_or_default();
            Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed())
        }
    }

    fn frame(index: i64, quantity: &str, is_buyer_maker: bool) -> String {
        format!(
            r#"{{"e":"aggTrade","E":{time},"s":"BTCUSDT","a":{index},"p":"{price}","q":"{quantity}","f":{index},"l":{index},"T":{time},"m":{is_buyer_maker},"M":true}}"#,
            time = 1_672_515_782_000 + index * 250,
            price = 16_500 + index,
        )
    }

    fn service(connections: Vec<Vec<String>>) -> VpinService<ScriptedSource, ExponentialBackoff> {
        VpinService::new(
            ScriptedSource::new(connections),
            ExponentialBackoff::default(),
            EngineConfig::default()
                .with_bucket_volume(dec!(1))
                .with_window_size(2),
            Broadcaster::new(&StreamConfig::default()),
        )
        .unwrap()
    }

    async fn next_update(subscription: &mut Subscription) -> crate::accumulator::VpinSample {
        loop {
            match subscription.receiver.recv().await {
                Some(SubscriberMessage::VpinUpdate(sample)) => return sample,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent_and_keep_state() {
        let service = service(vec![
            (0..4).map(|index| frame(index, "0.5", false)).collect(),
            vec![frame(4, "0.5", false), frame(5, "0.5", true)],
        ]);
        let mut subscription = service.broadcaster().on_subscribe().unwrap();

        assert!(service.start().await);
        assert!(!service.start().await);

        let sample = next_update(&mut subscription).await;
        assert_eq!((sample.bucket_id, sample.vpin, sample.trade_count), (2, dec!(1), 4));

        assert!(service.stop().await);
        assert!(!service.stop().await);
        let status = service.status();
        assert!(!status.streaming);
        assert_eq!(status.ingestor_state, IngestorState::Stopped);
        assert_eq!(status.trade_count, 4);
        assert_eq!(status.current_vpin, Some(dec!(1)));

        // Accumulator continues from bucket 2 after restarting
        assert!(service.start().await);
        let sample = next_update(&mut subscription).await;
        assert_eq!((sample.bucket_id, sample.vpin, sample.trade_count), (3, dec!(0.5), 6));
        assert!(service.stop().await);
    }

    #[tokio::test]
    async fn test_reset_discards_state_and_optionally_resumes() {
        let service = service(vec![
            (0..4).map(|index| frame(index, "0.5", false)).collect(),
            (10..14).map(|index| frame(index, "0.5", true)).collect(),
        ]);
        let mut existing = service.broadcaster().on_subscribe().unwrap();

        assert!(service.start().await);
        next_update(&mut existing).await;

        let snapshot = service.reset(false).await;
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.trade_count, 0);
        assert_eq!(snapshot.history_len, 0);
        assert_eq!(snapshot.connected_clients, 1);
        assert!(matches!(
            existing.receiver.recv().await,
            Some(SubscriberMessage::SystemReset(_))
        ));

        let mut joined = service.broadcaster().on_subscribe().unwrap();
        assert_eq!(
            joined.receiver.recv().await,
            Some(SubscriberMessage::History(vec![]))
        );

        let snapshot = service.reset(true).await;
        assert!(snapshot.streaming);
        let sample = next_update(&mut joined).await;
        assert_eq!((sample.bucket_id, sample.trade_count), (2, 4));
        assert!(service.stop().await);
    }

    #[tokio::test]
    async fn test_live_pipeline_matches_backtest() {
        let frames = (0..40)
            .map(|index| {
                let quantity = ["0.3", "0.7", "1.25", "0.05"][index as usize % 4];
                frame(index, quantity, index % 3 == 0)
            })
            .collect::<Vec<_>>();
        let trades = frames
            .iter()
            .map(|frame| FeedFormat::BinanceAggTrade.decode(frame).unwrap().unwrap())
            .collect::<Vec<_>>();

        let service = service(vec![frames]);
        let backtest = service.run_backtest(&trades);
        assert!(!backtest.samples.is_empty());

        let mut subscription = service.broadcaster().on_subscribe().unwrap();
        assert!(service.start().await);

        let mut live = Vec::new();
        while live.len() < backtest.samples.len() {
            live.push(next_update(&mut subscription).await);
        }
        assert!(service.stop().await);

        assert_eq!(live, backtest.samples);
        assert_eq!(service.status().trade_count, backtest.summary.trades);
    }

    #[tokio::test]
    async fn test_escalation_publishes_anomaly_event() {
        let (publisher, mut events) = AnomalyPublisher::new(8);
        let service = service(vec![
            (0..4).map(|index| frame(index, "0.5", false)).collect(),
        ])
        .with_anomalies(publisher);

        assert!(service.start().await);
        let event = events.recv().await.unwrap();
        assert!(service.stop().await);

        assert_eq!(event.previous, AlertLevel::Normal);
        assert_eq!(event.current, AlertLevel::Critical);
        assert_eq!(event.context.last(), Some(&event.sample));
        assert_eq!(events.try_recv().ok(), None);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted() {
        let service = service(vec![vec![
            "{not json".to_string(),
            r#"{"result":null,"id":1}"#.to_string(),
            frame(0, "0.5", false),
        ]]);
        let mut subscription = service.broadcaster().on_subscribe().unwrap();
        assert_eq!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::History(vec![]))
        );

        assert!(service.start().await);
        while service.status().trade_count < 1 {
            tokio::task::yield_now().await;
        }
        assert!(service.stop().await);

        let status = service.status();
        assert_eq!(status.malformed_messages, 1);
        assert_eq!(status.latest_price, Some(dec!(16500)));
    }
}
