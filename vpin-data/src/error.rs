use thiserror::Error;

/// Invalid configuration detected before any ingestion starts.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("bucket volume must be positive, got: {0}")]
    BucketVolume(String),

    #[error("rolling window size must be at least 1 bucket")]
    WindowSize,

    #[error("history capacity must be at least 1 sample")]
    HistoryCapacity,

    #[error("queue capacity for {0} must be at least 1")]
    QueueCapacity(&'static str),

    #[error("alert threshold must be within [0, 1], got: {0}")]
    AlertThreshold(String),

    #[error("invalid feed url {url}: {reason}")]
    FeedUrl { url: String, reason: String },

    #[error("backoff ceiling {ceiling_ms}ms is below base delay {base_ms}ms")]
    Backoff { base_ms: u64, ceiling_ms: u64 },

    #[error("environment variable {key} has invalid value: {value}")]
    Env { key: &'static str, value: String },
}

/// Failure to decode an upstream frame into a [`Trade`](crate::trade::Trade).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed JSON payload: {0}")]
    Json(String),

    #[error("unexpected event type: expected {expected}, got {actual}")]
    EventType {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid trade: {0}")]
    InvalidTrade(String),

    #[error("invalid trade timestamp: {0}ms")]
    Timestamp(i64),
}

/// Transient failures of the upstream feed connection.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FeedError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("stream read timeout: no data received for {0} seconds")]
    ReadTimeout(u64),
}

impl FeedError {
    /// Determine if an error requires the current connection to be torn down and re-established.
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::Connect { .. } | FeedError::ReadTimeout(_) => true,
            FeedError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                // Covers ConnectionClosed, AlreadyClosed and close frame errors
                error_lower.contains("closed")
                    || error_lower.contains("io error")
                    || error_lower.contains("protocol")
            }
        }
    }
}

/// Failures of the external anomaly agent collaborator.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Request(String),

    #[error("agent returned an invalid brief: {0}")]
    InvalidBrief(String),

    #[error("agent timed out after {0} seconds")]
    Timeout(u64),
}

/// Failures fetching historical trades for a backtest.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(String),

    #[error("history endpoint returned status {0}")]
    Status(u16),

    #[error("failed to decode historical trade: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid history range: start {start} is not before end {end}")]
    Range { start: String, end: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_is_terminal() {
        struct TestCase {
            input: FeedError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: connect failure always requires a fresh attempt
                input: FeedError::Connect {
                    url: "wss://stream.binance.com:9443/ws/btcusdt@aggTrade".to_string(),
                    reason: "dns error".to_string(),
                },
                expected: true,
            },
            TestCase {
                // TC1: read timeout indicates silent stream death
                input: FeedError::ReadTimeout(120),
                expected: true,
            },
            TestCase {
                // TC2: socket error containing "ConnectionClosed"
                input: FeedError::Socket("WebSocket error: ConnectionClosed".to_string()),
                expected: true,
            },
            TestCase {
                // TC3: socket error containing an IO failure
                input: FeedError::Socket("IO error: connection reset by peer".to_string()),
                expected: true,
            },
            TestCase {
                // TC4: capacity warning is not terminal
                input: FeedError::Socket("Space limit exceeded: message too long".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
