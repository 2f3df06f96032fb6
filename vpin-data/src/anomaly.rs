//! Outbound anomaly notifications towards the external investigation agent.
//!
//! The live pipeline publishes an [`AnomalyEvent`] on every severity escalation with a
//! non-blocking `try_send`. A separate dispatcher task drains the queue, calls the
//! [`AnomalyAgent`] under a timeout and pushes any returned brief back through the
//! [`Broadcaster`].

use crate::{
    accumulator::VpinSample, alert::AlertLevel, broadcast::Broadcaster, error::AgentError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

/// Maximum number of recent samples attached to an [`AnomalyEvent`].
pub const ANOMALY_CONTEXT_LEN: usize = 20;

/// Severity escalation of the live VPIN score.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AnomalyEvent {
    pub previous: AlertLevel,
    pub current: AlertLevel,
    pub sample: VpinSample,
    /// Most recent samples, oldest first, ending with `sample`.
    pub context: Vec<VpinSample>,
    /// [`Broadcaster::generation`] when the event was raised.
    pub generation: u64,
}

/// Producer half of the bounded anomaly queue.
#[derive(Debug, Clone)]
pub struct AnomalyPublisher {
    sender: Option<mpsc::Sender<AnomalyEvent>>,
}

impl AnomalyPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnomalyEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Publisher that discards every event, used when no agent is configured.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Enqueue without waiting. Returns false if the event was dropped.
    pub fn publish(&self, event: AnomalyEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    level = %event.current,
                    "anomaly queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("anomaly dispatcher stopped, dropping event");
                false
            }
        }
    }
}

/// External collaborator investigating anomalies and producing an opaque brief.
#[async_trait]
pub trait AnomalyAgent: Send + Sync {
    async fn investigate(&self, event: &AnomalyEvent) -> Result<serde_json::Value, AgentError>;
}

/// [`AnomalyAgent`] posting each event as JSON to an HTTP endpoint and treating the JSON
/// response body as the brief.
#[derive(Debug, Clone)]
pub struct WebhookAgent {
    client: reqwest::Client,
    url: Url,
}

impl WebhookAgent {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Construct from `VPIN_AGENT_URL`, returning `None` when it is unset or invalid.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("VPIN_AGENT_URL").ok()?;
        match Url::parse(raw.trim()) {
            Ok(url) => Some(Self::new(url)),
            Err(error) => {
                warn!(url = %raw, %error, "ignoring invalid VPIN_AGENT_URL");
                None
            }
        }
    }
}

#[async_trait]
impl AnomalyAgent for WebhookAgent {
    async fn investigate(&self, event: &AnomalyEvent) -> Result<serde_json::Value, AgentError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| AgentError::Request(error.to_string()))?;

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|error| AgentError::InvalidBrief(error.to_string()))
    }
}

/// Spawn the task draining the anomaly queue. Agent failures and timeouts are logged and never
/// reach the ingestion path. The task ends once every [`AnomalyPublisher`] is dropped.
pub fn spawn_dispatcher<Agent>(
    agent: Arc<Agent>,
    mut events: mpsc::Receiver<AnomalyEvent>,
    broadcaster: Broadcaster,
    timeout: Duration,
) -> JoinHandle<()>
where
    Agent: AnomalyAgent + ?Sized + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let level = event.current;
            match tokio::time::timeout(timeout, agent.investigate(&event)).await {
                Ok(Ok(brief)) => match broadcaster.publish_brief(event.generation, brief) {
                    Some(delivered) => info!(%level, delivered, "published intelligence brief"),
                    None => info!(%level, "stream reset since anomaly, brief discarded"),
                },
                Ok(Err(error)) => {
                    warn!(%level, %error, "anomaly agent failed");
                }
                Err(_) => {
                    warn!(
                        %level,
                        error = %AgentError::Timeout(timeout.as_secs()),
                        "anomaly agent failed"
                    );
                }
            }
        }
        debug!("anomaly dispatcher finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broadcast::SubscriberMessage, config::StreamConfig};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn event(current: AlertLevel, generation: u64) -> AnomalyEvent {
        let sample = VpinSample {
            observed_at: Utc.timestamp_opt(1_667_822_400, 0).unwrap(),
            vpin: dec!(0.8),
            alert_level: current,
            alert: true,
            bucket_id: 51,
            buy_volume: dec!(0.9),
            sell_volume: dec!(0.1),
            order_imbalance: dec!(0.9),
            latest_price: dec!(20000),
            trade_count: 120,
        };
        AnomalyEvent {
            previous: AlertLevel::Moderate,
            current,
            context: vec![sample.clone()],
            sample,
            generation,
        }
    }

    enum Behaviour {
        Brief,
        Fail,
        Hang,
    }

    struct ScriptedAgent(Behaviour);

    #[async_trait]
    impl AnomalyAgent for ScriptedAgent {
        async fn investigate(
            &self,
            event: &AnomalyEvent,
        ) -> Result<serde_json::Value, AgentError> {
            match self.0 {
                Behaviour::Brief => Ok(serde_json::json!({ "level": event.current })),
                Behaviour::Fail => Err(AgentError::Request("503".to_string())),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    #[test]
    fn test_publish_drops_when_full_or_disabled() {
        let (publisher, mut receiver) = AnomalyPublisher::new(1);

        assert!(publisher.publish(event(AlertLevel::High, 0)));
        assert!(!publisher.publish(event(AlertLevel::Critical, 0)));
        assert_eq!(receiver.try_recv().unwrap().current, AlertLevel::High);

        drop(receiver);
        assert!(!publisher.publish(event(AlertLevel::High, 0)));
        assert!(!AnomalyPublisher::disabled().publish(event(AlertLevel::High, 0)));
    }

    #[tokio::test]
    async fn test_dispatcher_publishes_brief() {
        let broadcaster = Broadcaster::new(&StreamConfig::default());
        let mut subscription = broadcaster.on_subscribe().unwrap();
        let (publisher, receiver) = AnomalyPublisher::new(4);
        let dispatcher = spawn_dispatcher(
            Arc::new(ScriptedAgent(Behaviour::Brief)),
            receiver,
            broadcaster.clone(),
            Duration::from_secs(1),
        );

        assert!(publisher.publish(event(AlertLevel::High, 0)));
        drop(publisher);
        dispatcher.await.unwrap();

        assert_eq!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::History(vec![]))
        );
        assert_eq!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::IntelligenceBrief(
                serde_json::json!({ "level": "HIGH" })
            ))
        );
    }

    #[tokio::test]
    async fn test_dispatcher_discards_brief_after_reset() {
        let broadcaster = Broadcaster::new(&StreamConfig::default());
        let mut subscription = broadcaster.on_subscribe().unwrap();
        let (publisher, receiver) = AnomalyPublisher::new(4);

        // Raised before the reset, investigated after it
        assert!(publisher.publish(event(AlertLevel::High, broadcaster.generation())));
        broadcaster.reset();
        assert!(publisher.publish(event(AlertLevel::Critical, broadcaster.generation())));
        drop(publisher);

        spawn_dispatcher(
            Arc::new(ScriptedAgent(Behaviour::Brief)),
            receiver,
            broadcaster.clone(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(
            broadcaster.latest_brief(),
            Some(serde_json::json!({ "level": "CRITICAL" }))
        );
        assert_eq!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::History(vec![]))
        );
        assert!(matches!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::SystemReset(_))
        ));
        assert_eq!(
            subscription.receiver.recv().await,
            Some(SubscriberMessage::IntelligenceBrief(
                serde_json::json!({ "level": "CRITICAL" })
            ))
        );
        assert!(subscription.receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_survives_agent_failures() {
        for behaviour in [Behaviour::Fail, Behaviour::Hang] {
            let broadcaster = Broadcaster::new(&StreamConfig::default());
            let (publisher, receiver) = AnomalyPublisher::new(4);
            let dispatcher = spawn_dispatcher(
                Arc::new(ScriptedAgent(behaviour)),
                receiver,
                broadcaster.clone(),
                Duration::from_secs(30),
            );

            assert!(publisher.publish(event(AlertLevel::High, 0)));
            assert!(publisher.publish(event(AlertLevel::Critical, 0)));
            drop(publisher);
            dispatcher.await.unwrap();

            assert_eq!(broadcaster.latest_brief(), None);
        }
    }
}
