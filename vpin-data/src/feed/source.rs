use super::timeout::{DEFAULT_READ_TIMEOUT, TimeoutStream};
use crate::error::FeedError;
use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

/// Stream of raw text frames from one upstream connection. The stream ending, or yielding a
/// terminal [`FeedError`], means the connection is gone.
pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

/// Connector for the upstream trade feed.
///
/// Abstracted so the [`FeedIngestor`](super::FeedIngestor) state machine can be driven by
/// scripted sources in tests.
#[async_trait]
pub trait TradeSource: Send + Sync {
    async fn connect(&self) -> Result<FrameStream, FeedError>;
}

#[async_trait]
impl<Source> TradeSource for Arc<Source>
where
    Source: TradeSource + ?Sized,
{
    async fn connect(&self) -> Result<FrameStream, FeedError> {
        (**self).connect().await
    }
}

/// [`TradeSource`] backed by a `tokio-tungstenite` WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    url: Url,
    read_timeout: Duration,
}

impl WebSocketSource {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl TradeSource for WebSocketSource {
    async fn connect(&self) -> Result<FrameStream, FeedError> {
        let (websocket, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|error| FeedError::Connect {
                    url: self.url.to_string(),
                    reason: error.to_string(),
                })?;

        // Every frame, including heartbeat pings, resets the idle deadline. Pings are answered
        // by tungstenite while the stream is polled
        let messages = websocket
            .map(|message| message.map_err(|error| FeedError::Socket(error.to_string())));

        let frames = TimeoutStream::new(Box::pin(messages), self.read_timeout)
            .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!("discarding non utf8 binary frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(error) => Some(Err(error)),
                })
            });

        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Local WebSocket server sending a ping every `interval`, or nothing when `None`.
    async fn heartbeat_server(interval: Option<Duration>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut websocket = accept_async(stream).await.unwrap();
            match interval {
                Some(interval) => loop {
                    tokio::time::sleep(interval).await;
                    if websocket.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        });

        Url::parse(&format!("ws://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_pings_keep_connection_alive() {
        let url = heartbeat_server(Some(Duration::from_millis(300))).await;
        let source = WebSocketSource::new(url).with_read_timeout(Duration::from_secs(1));
        let mut frames = source.connect().await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(2_500), frames.next()).await;
        assert!(next.is_err(), "connection torn down: {next:?}");
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let url = heartbeat_server(None).await;
        let source = WebSocketSource::new(url).with_read_timeout(Duration::from_secs(1));
        let mut frames = source.connect().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), frames.next()).await;
        assert_eq!(next.ok(), Some(Some(Err(FeedError::ReadTimeout(1)))));
        assert_eq!(frames.next().await, None);
    }
}
