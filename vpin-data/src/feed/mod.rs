//! Upstream trade feed ingestion.
//!
//! The [`FeedIngestor`] owns exactly one logical connection to a [`TradeSource`] and walks the
//! state machine `Disconnected -> Connecting -> Streaming -> (Disconnected | Stopped)`, retrying
//! with an injectable [`Backoff`] policy until it is told to stop.

use crate::{
    config::parse_or,
    error::{ConfigError, DecodeError},
    trade::Trade,
};
use derive_more::Display;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

pub mod backoff;
pub mod binance;
pub mod source;
pub mod timeout;

use backoff::{Backoff, ExponentialBackoff};
use binance::FeedFormat;
use source::{TradeSource, WebSocketSource};

/// Connection state of the [`FeedIngestor`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum IngestorState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    /// Terminal until the ingestor is started again.
    Stopped,
}

/// Receives everything the [`FeedIngestor`] produces, on the ingestion task.
pub trait FeedHandler: Send {
    fn on_trade(&mut self, trade: Trade);

    fn on_state(&mut self, _state: IngestorState) {}

    fn on_malformed(&mut self, _error: &DecodeError) {}
}

/// Binance spot BTC/USDT `aggTrade` stream.
pub const DEFAULT_FEED_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@aggTrade";

/// Upstream feed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub url: Url,
    pub format: FeedFormat,
    pub read_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_FEED_URL).expect("Failed to parse default Binance feed url"),
            format: FeedFormat::BinanceAggTrade,
            read_timeout: timeout::DEFAULT_READ_TIMEOUT,
            backoff_base: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(30),
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with a custom url.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(url).map_err(|error| ConfigError::FeedUrl {
            url: url.to_string(),
            reason: error.to_string(),
        })?;
        Ok(Self {
            url,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: FeedFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_ceiling = ceiling;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            scheme => {
                return Err(ConfigError::FeedUrl {
                    url: self.url.to_string(),
                    reason: format!("unsupported scheme {scheme}"),
                });
            }
        }
        self.backoff().map(|_| ())
    }

    pub fn backoff(&self) -> Result<ExponentialBackoff, ConfigError> {
        ExponentialBackoff::new(self.backoff_base, self.backoff_ceiling)
    }

    pub fn source(&self) -> WebSocketSource {
        WebSocketSource::new(self.url.clone()).with_read_timeout(self.read_timeout)
    }

    /// Construct from `VPIN_FEED_URL`, `VPIN_FEED_FORMAT` (`aggTrade` or `trade`),
    /// `VPIN_FEED_READ_TIMEOUT_SECS`, `VPIN_BACKOFF_BASE_MS` and `VPIN_BACKOFF_CEILING_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let format = match lookup("VPIN_FEED_FORMAT").as_deref().map(str::trim) {
            None | Some("aggTrade") => FeedFormat::BinanceAggTrade,
            Some("trade") => FeedFormat::BinanceTrade,
            Some(other) => {
                return Err(ConfigError::Env {
                    key: "VPIN_FEED_FORMAT",
                    value: other.to_string(),
                });
            }
        };

        let mut config = match lookup("VPIN_FEED_URL") {
            Some(url) => Self::new(url.trim())?,
            None => Self::new(&format.stream_url("btcusdt"))?,
        }
        .with_format(format);

        let defaults = Self::default();
        config.read_timeout = Duration::from_secs(parse_or(
            &lookup,
            "VPIN_FEED_READ_TIMEOUT_SECS",
            defaults.read_timeout.as_secs(),
        )?);
        config.backoff_base = Duration::from_millis(parse_or(
            &lookup,
            "VPIN_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        )?);
        config.backoff_ceiling = Duration::from_millis(parse_or(
            &lookup,
            "VPIN_BACKOFF_CEILING_MS",
            defaults.backoff_ceiling.as_millis() as u64,
        )?);

        config.validate()?;
        Ok(config)
    }
}

/// Drives one [`TradeSource`] connection at a time, decoding frames into [`Trade`]s for a
/// [`FeedHandler`] and reconnecting with backoff until shutdown is signalled.
#[derive(Debug)]
pub struct FeedIngestor<Source, Policy> {
    source: Source,
    backoff: Policy,
    format: FeedFormat,
    state: IngestorState,
}

impl<Source, Policy> FeedIngestor<Source, Policy>
where
    Source: TradeSource,
    Policy: Backoff,
{
    pub fn new(source: Source, backoff: Policy, format: FeedFormat) -> Self {
        Self {
            source,
            backoff,
            format,
            state: IngestorState::Disconnected,
        }
    }

    pub fn state(&self) -> IngestorState {
        self.state
    }

    fn transition<Handler: FeedHandler>(&mut self, next: IngestorState, handler: &mut Handler) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "feed ingestor transition");
            self.state = next;
            handler.on_state(next);
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then transition to
    /// [`IngestorState::Stopped`].
    ///
    /// Shutdown is observed while connecting, while streaming and while sleeping between
    /// attempts, so a stop request never waits on the upstream socket or a backoff delay. The
    /// active connection is dropped, closing the socket, as soon as shutdown is observed.
    pub async fn run<Handler>(&mut self, handler: &mut Handler, shutdown: &mut watch::Receiver<bool>)
    where
        Handler: FeedHandler,
    {
        let mut attempt: u32 = 0;

        'connection: loop {
            if *shutdown.borrow_and_update() {
                break 'connection;
            }

            self.transition(IngestorState::Connecting, handler);

            let connection = tokio::select! {
                biased;
                _ = shutdown_signal(shutdown) => break 'connection,
                connection = self.source.connect() => connection,
            };

            match connection {
                Ok(mut frames) => {
                    info!(attempt, format = %self.format, "feed connected");
                    attempt = 0;
                    self.transition(IngestorState::Streaming, handler);

                    loop {
                        let frame = tokio::select! {
                            biased;
                            _ = shutdown_signal(shutdown) => break 'connection,
                            frame = frames.next() => frame,
                        };

                        match frame {
                            Some(Ok(text)) => match self.format.decode(&text) {
                                Ok(Some(trade)) => handler.on_trade(trade),
                                Ok(None) => {}
                                Err(error) => {
                                    debug!(%error, "discarding malformed feed frame");
                                    handler.on_malformed(&error);
                                }
                            },
                            Some(Err(error)) if error.is_terminal() => {
                                warn!(%error, "feed connection lost");
                                break;
                            }
                            Some(Err(error)) => {
                                warn!(%error, "feed generated non-terminal error");
                            }
                            None => {
                                warn!("feed closed by upstream");
                                break;
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, attempt, "feed connection attempt failed");
                }
            }

            self.transition(IngestorState::Disconnected, handler);

            let delay = self.backoff.next_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "waiting before reconnecting feed");

            tokio::select! {
                biased;
                _ = shutdown_signal(shutdown) => break 'connection,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(IngestorState::Stopped, handler);
        info!("feed ingestor stopped");
    }
}

/// Resolves once shutdown is requested or the controlling side has gone away.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("feed shutdown sender dropped");
    }
}
