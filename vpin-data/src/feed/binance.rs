use crate::{error::DecodeError, trade::Trade};
use chrono::DateTime;
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Binance spot WebSocket base url.
pub const BINANCE_SPOT_WS_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Versioned upstream wire formats understood by the [`FeedIngestor`](super::FeedIngestor).
///
/// Each format accepts exactly one event type, so pointing the ingestor at the wrong stream shows
/// up as counted decode failures rather than silently mis-parsed trades.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize, Display)]
pub enum FeedFormat {
    /// Binance `<symbol>@aggTrade` stream, v3 payload.
    #[default]
    #[display("aggTrade")]
    BinanceAggTrade,
    /// Binance `<symbol>@trade` stream, v3 payload.
    #[display("trade")]
    BinanceTrade,
}

impl FeedFormat {
    /// Event type carried in the `"e"` field of every frame of this format.
    pub fn event_type(&self) -> &'static str {
        match self {
            FeedFormat::BinanceAggTrade => "aggTrade",
            FeedFormat::BinanceTrade => "trade",
        }
    }

    /// Binance stream url for the provided lowercase symbol, eg/ "btcusdt".
    pub fn stream_url(&self, symbol: &str) -> String {
        format!(
            "{BINANCE_SPOT_WS_BASE}/{}@{}",
            symbol.to_lowercase(),
            self.event_type()
        )
    }

    /// Decode a text frame into a [`Trade`].
    ///
    /// Returns `Ok(None)` for subscription acknowledgements, which carry no trade.
    pub fn decode(&self, text: &str) -> Result<Option<Trade>, DecodeError> {
        let frame = match serde_json::from_str::<BinanceTradeFrame>(text) {
            Ok(frame) => frame,
            Err(error) => {
                return match serde_json::from_str::<BinanceAck>(text) {
                    Ok(_) => Ok(None),
                    Err(_) => Err(DecodeError::Json(error.to_string())),
                };
            }
        };

        let expected = self.event_type();
        match frame.event.as_deref() {
            Some(event) if event == expected => frame.into_trade().map(Some),
            other => Err(DecodeError::EventType {
                expected,
                actual: other.unwrap_or("<missing>").to_string(),
            }),
        }
    }
}

/// ### Raw Payload Examples
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams>
/// Aggregate trade stream
/// ```json
/// {
///     "e": "aggTrade",
///     "E": 1672515782136,
///     "s": "BTCUSDT",
///     "a": 12345,
///     "p": "16578.50",
///     "q": "0.00100000",
///     "f": 100,
///     "l": 105,
///     "T": 1672515782136,
///     "m": true,
///     "M": true
/// }
/// ```
///
/// REST `GET /api/v3/aggTrades` entries share the same fields without `"e"` and `"s"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BinanceTradeFrame {
    #[serde(rename = "e", default)]
    pub event: Option<String>,

    /// Aggregate trade id, present on `aggTrade` frames and REST `aggTrades` entries.
    #[serde(rename = "a", default)]
    pub agg_trade_id: Option<u64>,

    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,

    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    #[serde(rename = "T")]
    pub trade_time_ms: i64,

    /// Buyer was the passive side, ie/ the seller aggressed.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl BinanceTradeFrame {
    pub fn into_trade(self) -> Result<Trade, DecodeError> {
        let occurred_at = DateTime::from_timestamp_millis(self.trade_time_ms)
            .ok_or(DecodeError::Timestamp(self.trade_time_ms))?;
        Trade::new(self.price, self.quantity, occurred_at, !self.is_buyer_maker)
    }
}

/// Response to a `SUBSCRIBE` / `UNSUBSCRIBE` request, eg/ `{"result":null,"id":1}`.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct BinanceAck {
    result: serde_json::Value,
    id: u64,
}

/// Entry of a REST `aggTrades` response: the decoded [`Trade`] and its aggregate trade id, used
/// to page with `fromId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggTrade {
    pub id: u64,
    pub trade: Trade,
}

/// Decode a REST `aggTrades` response body, preserving exchange order.
pub fn decode_agg_trades(body: &str) -> Result<Vec<AggTrade>, DecodeError> {
    serde_json::from_str::<Vec<BinanceTradeFrame>>(body)
        .map_err(|error| DecodeError::Json(error.to_string()))?
        .into_iter()
        .map(|frame| {
            let id = frame.agg_trade_id.ok_or_else(|| {
                DecodeError::InvalidTrade("missing aggregate trade id".to_string())
            })?;
            Ok(AggTrade {
                id,
                trade: frame.into_trade()?,
            })
        })
        .collect()
}
