//! Binance spot public streams.
//!
//! One raw stream per connection on `wss://stream.binance.com:9443/ws`,
//! selected with a `SUBSCRIBE` request after the handshake. The server
//! sends transport-level pings; no client heartbeat frame is needed.

use crate::fields::{id, int, levels, num, text};
use mdstream_core::{
    now_ms, CanonicalSymbol, Candle, Exchange, MarketEvent, OrderBookSnapshot, StreamType,
    Ticker, Timeframe, Topic, Trade, TradeSide,
};
use mdstream_ws::{ExchangeAdapter, FrameError, InboundFrame};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
pub const BINANCE_REST_URL: &str = "https://api.binance.com";

/// Depth levels requested for order book streams.
const DEPTH_LEVELS: u32 = 20;

/// Binance native symbols drop the separator, so the quote boundary is
/// only recoverable for symbols this adapter has spelled before, or for
/// quotes `CanonicalSymbol::parse` knows.
#[derive(Debug, Default)]
pub struct BinanceAdapter {
    emitted: RwLock<HashMap<String, CanonicalSymbol>>,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stream name, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self, topic: &Topic) -> String {
        let symbol = self.normalize_symbol(&topic.symbol).to_ascii_lowercase();
        match (topic.stream, topic.timeframe) {
            (StreamType::Ticker, _) => format!("{symbol}@ticker"),
            (StreamType::OrderBook, _) => format!("{symbol}@depth{DEPTH_LEVELS}@100ms"),
            (StreamType::Trade, _) => format!("{symbol}@trade"),
            (StreamType::Candle, Some(tf)) => format!("{symbol}@kline_{}", self.map_timeframe(tf)),
            // Topic construction guarantees candles carry a timeframe.
            (StreamType::Candle, None) => format!("{symbol}@kline_1m"),
        }
    }

    fn control_frame(&self, method: &str, topic: &Topic, request_id: u64) -> String {
        json!({
            "method": method,
            "params": [self.stream_name(topic)],
            "id": request_id,
        })
        .to_string()
    }

    fn check_symbol(&self, topic: &Topic, data: &Value) -> Result<(), FrameError> {
        if let Some(native) = data.get("s").and_then(Value::as_str) {
            if !native.eq_ignore_ascii_case(&self.normalize_symbol(&topic.symbol)) {
                return Err(FrameError::Malformed(format!(
                    "symbol {native} on {} stream",
                    topic.symbol
                )));
            }
        }
        Ok(())
    }

    fn parse_ticker(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let ticker = Ticker {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Binance,
            price: num(data, "c")?,
            bid: num(data, "b")?,
            ask: num(data, "a")?,
            volume_24h: num(data, "v")?,
            high_24h: num(data, "h")?,
            low_24h: num(data, "l")?,
            change_24h_percent: num(data, "P")?,
            timestamp_ms: int(data, "E")?,
        };
        ticker.validate()?;
        Ok(MarketEvent::Ticker(ticker))
    }

    fn parse_trade(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        // `m`: buyer was the maker, so the aggressor sold.
        let buyer_is_maker = data.get("m").and_then(Value::as_bool).unwrap_or(false);
        let trade = Trade {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Binance,
            trade_id: id(data, "t")?,
            price: num(data, "p")?,
            size: num(data, "q")?,
            side: if buyer_is_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            },
            timestamp_ms: int(data, "T")?,
        };
        trade.validate()?;
        Ok(MarketEvent::Trade(trade))
    }

    fn parse_kline(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let k = data.get("k").ok_or(FrameError::MissingField("k"))?;
        let interval = text(k, "i")?;
        let timeframe = interval
            .parse::<Timeframe>()
            .map_err(FrameError::InvalidRecord)?;
        if Some(timeframe) != topic.timeframe {
            return Err(FrameError::Malformed(format!(
                "kline interval {interval} on {topic}"
            )));
        }
        let candle = Candle {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Binance,
            timeframe,
            open_time_ms: int(k, "t")?,
            open: num(k, "o")?,
            high: num(k, "h")?,
            low: num(k, "l")?,
            close: num(k, "c")?,
            volume: num(k, "v")?,
            closed: k.get("x").and_then(Value::as_bool).unwrap_or(false),
        };
        candle.validate()?;
        Ok(MarketEvent::Candle(candle))
    }

    /// Partial depth frames carry neither symbol nor time.
    fn parse_depth(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let sequence = data.get("lastUpdateId").and_then(Value::as_u64);
        let book = OrderBookSnapshot::new(
            topic.symbol.clone(),
            Exchange::Binance,
            levels(data, "bids")?,
            levels(data, "asks")?,
            now_ms(),
            sequence,
        )?;
        Ok(MarketEvent::OrderBook(book))
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn build_subscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        self.control_frame("SUBSCRIBE", topic, request_id)
    }

    fn build_unsubscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        self.control_frame("UNSUBSCRIBE", topic, request_id)
    }

    fn parse_frame(&self, topic: &Topic, raw: &str) -> Result<InboundFrame, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(FrameError::Malformed("expected a JSON object".to_string()));
        }
        // Combined-stream wrapper: {"stream": "...", "data": {...}}
        let data = match (value.get("stream"), value.get("data")) {
            (Some(_), Some(inner)) => inner,
            _ => &value,
        };

        if let Some(err) = data.get("error") {
            return Ok(InboundFrame::Error {
                code: err.get("code").and_then(Value::as_i64),
                message: err
                    .get("msg")
                    .and_then(Value::as_str)
                    .map_or_else(|| err.to_string(), str::to_string),
            });
        }
        if let (Some(code), Some(msg)) = (data.get("code"), data.get("msg")) {
            return Ok(InboundFrame::Error {
                code: code.as_i64(),
                message: msg.as_str().map_or_else(|| msg.to_string(), str::to_string),
            });
        }
        if data.get("result").is_some() && data.get("id").is_some() {
            return Ok(InboundFrame::Ack {
                id: data.get("id").map(Value::to_string),
            });
        }

        let event = match (data.get("e").and_then(Value::as_str), topic.stream) {
            (Some("24hrTicker"), StreamType::Ticker) => {
                self.check_symbol(topic, data)?;
                self.parse_ticker(topic, data)?
            }
            (Some("trade"), StreamType::Trade) => {
                self.check_symbol(topic, data)?;
                self.parse_trade(topic, data)?
            }
            (Some("kline"), StreamType::Candle) => {
                self.check_symbol(topic, data)?;
                self.parse_kline(topic, data)?
            }
            (None, StreamType::OrderBook) if data.get("lastUpdateId").is_some() => {
                self.parse_depth(topic, data)?
            }
            _ => return Ok(InboundFrame::Unknown(truncate(raw))),
        };
        Ok(InboundFrame::Data(vec![event]))
    }

    fn normalize_symbol(&self, symbol: &CanonicalSymbol) -> String {
        let native = symbol.concatenated();
        if !self.emitted.read().contains_key(&native) {
            self.emitted.write().insert(native.clone(), symbol.clone());
        }
        native
    }

    fn canonical_symbol(&self, native: &str) -> Option<CanonicalSymbol> {
        let key = native.to_ascii_uppercase();
        if let Some(symbol) = self.emitted.read().get(&key) {
            return Some(symbol.clone());
        }
        CanonicalSymbol::parse(&key).ok()
    }

    /// Binance interval names match the canonical spelling.
    fn map_timeframe(&self, timeframe: Timeframe) -> &'static str {
        timeframe.as_str()
    }
}

fn truncate(raw: &str) -> String {
    const MAX: usize = 256;
    if raw.len() <= MAX {
        return raw.to_string();
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
