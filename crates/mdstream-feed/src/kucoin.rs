//! KuCoin spot public streams.
//!
//! Connections need a token from the REST bullet endpoint (see
//! `mdstream-auth`). Every frame is an envelope typed by `type`; market
//! data arrives as `message` envelopes keyed by `topic`. The client must
//! send `ping` frames at the interval the bullet response advertises.

use crate::fields::{epoch_to_ms, id, int, levels, num, text};
use mdstream_core::{
    CanonicalSymbol, Candle, Exchange, MarketEvent, OrderBookSnapshot, StreamType, Ticker,
    Timeframe, Topic, Trade, TradeSide,
};
use mdstream_ws::{ExchangeAdapter, FrameError, InboundFrame};
use serde::Deserialize;
use serde_json::{json, Value};

pub const KUCOIN_REST_URL: &str = "https://api.kucoin.com";

/// Inbound envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Welcome {
        id: Option<String>,
    },
    Ack {
        id: Option<String>,
    },
    Ping {
        id: Option<String>,
    },
    Pong {
        id: Option<String>,
    },
    Message {
        topic: String,
        #[serde(default)]
        subject: Option<String>,
        data: Value,
    },
    Error {
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        data: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KucoinAdapter;

impl KucoinAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Topic string, e.g. `/market/candles:BTC-USDT_1min`.
    pub fn topic_name(&self, topic: &Topic) -> String {
        let symbol = self.normalize_symbol(&topic.symbol);
        match (topic.stream, topic.timeframe) {
            (StreamType::Ticker, _) => format!("/market/snapshot:{symbol}"),
            (StreamType::OrderBook, _) => format!("/spotMarket/level2Depth50:{symbol}"),
            (StreamType::Trade, _) => format!("/market/match:{symbol}"),
            (StreamType::Candle, tf) => format!(
                "/market/candles:{symbol}_{}",
                self.map_timeframe(tf.unwrap_or(Timeframe::M1))
            ),
        }
    }

    fn control_frame(&self, kind: &str, topic: &Topic, request_id: u64) -> String {
        json!({
            "id": request_id.to_string(),
            "type": kind,
            "topic": self.topic_name(topic),
            "privateChannel": false,
            "response": true,
        })
        .to_string()
    }

    /// Snapshot payloads nest the ticker under a second `data` key.
    fn parse_snapshot(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let d = data.get("data").unwrap_or(data);
        // `changeRate` is a fraction; canonical change is in percent.
        let change_rate = num(d, "changeRate").unwrap_or(0.0);
        let ticker = Ticker {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Kucoin,
            price: num(d, "lastTradedPrice")?,
            bid: num(d, "buy")?,
            ask: num(d, "sell")?,
            volume_24h: num(d, "vol")?,
            high_24h: num(d, "high")?,
            low_24h: num(d, "low")?,
            change_24h_percent: change_rate * 100.0,
            timestamp_ms: epoch_to_ms("datetime", int(d, "datetime")?)?,
        };
        ticker.validate()?;
        Ok(MarketEvent::Ticker(ticker))
    }

    fn parse_depth(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let book = OrderBookSnapshot::new(
            topic.symbol.clone(),
            Exchange::Kucoin,
            levels(data, "bids")?,
            levels(data, "asks")?,
            epoch_to_ms("timestamp", int(data, "timestamp")?)?,
            None,
        )?;
        Ok(MarketEvent::OrderBook(book))
    }

    fn parse_match(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let side = match text(data, "side")? {
            "buy" => TradeSide::Buy,
            "sell" => TradeSide::Sell,
            other => return Err(FrameError::Malformed(format!("trade side {other}"))),
        };
        let trade = Trade {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Kucoin,
            trade_id: id(data, "tradeId")?,
            price: num(data, "price")?,
            size: num(data, "size")?,
            side,
            timestamp_ms: epoch_to_ms("time", int(data, "time")?)?,
        };
        trade.validate()?;
        Ok(MarketEvent::Trade(trade))
    }

    /// `candles`: `[start_secs, open, close, high, low, volume, turnover]`.
    ///
    /// KuCoin pushes in-progress updates only, so `closed` stays false.
    fn parse_candle(&self, topic: &Topic, data: &Value) -> Result<MarketEvent, FrameError> {
        let timeframe = topic
            .timeframe
            .ok_or_else(|| FrameError::Malformed(format!("{topic} has no timeframe")))?;
        let row = data
            .get("candles")
            .and_then(Value::as_array)
            .ok_or(FrameError::MissingField("candles"))?;
        let cell = |idx: usize, field: &'static str| -> Result<f64, FrameError> {
            let value = row.get(idx).ok_or(FrameError::MissingField(field))?;
            let parsed = match value {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            };
            parsed.ok_or_else(|| FrameError::InvalidNumber {
                field,
                value: value.to_string(),
            })
        };
        let candle = Candle {
            symbol: topic.symbol.clone(),
            exchange: Exchange::Kucoin,
            timeframe,
            open_time_ms: epoch_to_ms("candles.start", cell(0, "candles.start")? as i64)?,
            open: cell(1, "candles.open")?,
            close: cell(2, "candles.close")?,
            high: cell(3, "candles.high")?,
            low: cell(4, "candles.low")?,
            volume: cell(5, "candles.volume")?,
            closed: false,
        };
        candle.validate()?;
        Ok(MarketEvent::Candle(candle))
    }
}

impl ExchangeAdapter for KucoinAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Kucoin
    }

    fn build_subscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        self.control_frame("subscribe", topic, request_id)
    }

    fn build_unsubscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        self.control_frame("unsubscribe", topic, request_id)
    }

    fn parse_frame(&self, topic: &Topic, raw: &str) -> Result<InboundFrame, FrameError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let frame = match envelope {
            Envelope::Welcome { id } => InboundFrame::Welcome { id },
            Envelope::Ack { id } => InboundFrame::Ack { id },
            Envelope::Ping { id } => InboundFrame::Ping { id },
            Envelope::Pong { id } => InboundFrame::Pong { id },
            Envelope::Error { code, data } => InboundFrame::Error {
                code: code.as_ref().and_then(|c| {
                    c.as_i64()
                        .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
                }),
                message: match data {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => "unspecified error".to_string(),
                },
            },
            Envelope::Message {
                topic: wire_topic,
                subject,
                data,
            } => {
                if wire_topic != self.topic_name(topic) {
                    return Ok(InboundFrame::Unknown(format!(
                        "message for {wire_topic} ({})",
                        subject.unwrap_or_default()
                    )));
                }
                let event = match topic.stream {
                    StreamType::Ticker => self.parse_snapshot(topic, &data)?,
                    StreamType::OrderBook => self.parse_depth(topic, &data)?,
                    StreamType::Trade => self.parse_match(topic, &data)?,
                    StreamType::Candle => self.parse_candle(topic, &data)?,
                };
                InboundFrame::Data(vec![event])
            }
            Envelope::Unknown => InboundFrame::Unknown(raw.chars().take(256).collect()),
        };
        Ok(frame)
    }

    /// KuCoin spells symbols dash-joined, like the canonical form.
    fn normalize_symbol(&self, symbol: &CanonicalSymbol) -> String {
        symbol.to_string()
    }

    fn canonical_symbol(&self, native: &str) -> Option<CanonicalSymbol> {
        CanonicalSymbol::parse(native).ok()
    }

    fn map_timeframe(&self, timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1min",
            Timeframe::M3 => "3min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::M30 => "30min",
            Timeframe::H1 => "1hour",
            Timeframe::H2 => "2hour",
            Timeframe::H4 => "4hour",
            Timeframe::H6 => "6hour",
            Timeframe::H8 => "8hour",
            Timeframe::H12 => "12hour",
            Timeframe::D1 => "1day",
            Timeframe::W1 => "1week",
        }
    }

    fn ping_frame(&self, request_id: u64) -> Option<String> {
        Some(json!({"id": request_id.to_string(), "type": "ping"}).to_string())
    }

    fn pong_frame(&self, id: Option<&str>) -> Option<String> {
        Some(json!({"id": id, "type": "pong"}).to_string())
    }
}
