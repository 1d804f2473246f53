//! Canonical market data records.
//!
//! Records are produced by an exchange adapter from one inbound frame and
//! are never mutated afterwards. Every constructor validates that numeric
//! fields are finite; order books additionally validate level ordering.

use crate::error::{CoreError, Result};
use crate::market::{CanonicalSymbol, Exchange, StreamType, Timeframe};
use serde::{Deserialize, Serialize};

fn finite(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CoreError::NonFinite { field })
    }
}

/// 24h ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: CanonicalSymbol,
    pub exchange: Exchange,
    /// Last traded price.
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    /// Base-asset volume over the trailing 24h.
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    /// Percent change over the trailing 24h (e.g. `1.5` for +1.5%).
    pub change_24h_percent: f64,
    /// Exchange event time, epoch milliseconds.
    pub timestamp_ms: i64,
}

impl Ticker {
    /// Check that every numeric field is finite.
    pub fn validate(&self) -> Result<()> {
        finite("price", self.price)?;
        finite("bid", self.bid)?;
        finite("ask", self.ask)?;
        finite("volume_24h", self.volume_24h)?;
        finite("high_24h", self.high_24h)?;
        finite("low_24h", self.low_24h)?;
        finite("change_24h_percent", self.change_24h_percent)
    }

    /// Mid price, or the last price when one side is missing.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.price
        }
    }
}

/// One order book level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Partial order book snapshot.
///
/// Invariant: bids are non-increasing and asks non-decreasing by price.
/// Fields are private so the invariant cannot be broken after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookSnapshot {
    symbol: CanonicalSymbol,
    exchange: Exchange,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    timestamp_ms: i64,
    sequence: Option<u64>,
}

impl OrderBookSnapshot {
    /// Build a snapshot, rejecting non-finite values and out-of-order levels.
    pub fn new(
        symbol: CanonicalSymbol,
        exchange: Exchange,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp_ms: i64,
        sequence: Option<u64>,
    ) -> Result<Self> {
        for level in bids.iter().chain(asks.iter()) {
            finite("level.price", level.price)?;
            finite("level.size", level.size)?;
        }
        if let Some(w) = bids.windows(2).find(|w| w[0].price < w[1].price) {
            return Err(CoreError::UnorderedBook(format!(
                "{exchange} {symbol}: bid {} above {}",
                w[1].price, w[0].price
            )));
        }
        if let Some(w) = asks.windows(2).find(|w| w[0].price > w[1].price) {
            return Err(CoreError::UnorderedBook(format!(
                "{exchange} {symbol}: ask {} below {}",
                w[1].price, w[0].price
            )));
        }
        Ok(Self {
            symbol,
            exchange,
            bids,
            asks,
            timestamp_ms,
            sequence,
        })
    }

    pub fn symbol(&self) -> &CanonicalSymbol {
        &self.symbol
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: CanonicalSymbol,
    pub exchange: Exchange,
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub timestamp_ms: i64,
}

impl Trade {
    pub fn validate(&self) -> Result<()> {
        finite("price", self.price)?;
        finite("size", self.size)
    }
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: CanonicalSymbol,
    pub exchange: Exchange,
    pub timeframe: Timeframe,
    /// Candle open time, epoch milliseconds.
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True once the interval has finished.
    pub closed: bool,
}

impl Candle {
    pub fn validate(&self) -> Result<()> {
        finite("open", self.open)?;
        finite("high", self.high)?;
        finite("low", self.low)?;
        finite("close", self.close)?;
        finite("volume", self.volume)
    }
}

/// Any canonical record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Ticker(Ticker),
    OrderBook(OrderBookSnapshot),
    Trade(Trade),
    Candle(Candle),
}

impl MarketEvent {
    pub fn stream_type(&self) -> StreamType {
        match self {
            Self::Ticker(_) => StreamType::Ticker,
            Self::OrderBook(_) => StreamType::OrderBook,
            Self::Trade(_) => StreamType::Trade,
            Self::Candle(_) => StreamType::Candle,
        }
    }

    pub fn exchange(&self) -> Exchange {
        match self {
            Self::Ticker(t) => t.exchange,
            Self::OrderBook(b) => b.exchange(),
            Self::Trade(t) => t.exchange,
            Self::Candle(c) => c.exchange,
        }
    }

    pub fn symbol(&self) -> &CanonicalSymbol {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::OrderBook(b) => b.symbol(),
            Self::Trade(t) => &t.symbol,
            Self::Candle(c) => &c.symbol,
        }
    }
}
