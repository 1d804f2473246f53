//! Core domain types for mdstream.
//!
//! This crate provides the exchange-neutral data model shared by every
//! other crate:
//! - `Exchange`, `CanonicalSymbol`, `Timeframe`, `StreamType`: identifiers
//! - `Topic`: the (exchange, stream, symbol, timeframe?) subscription key
//! - `Ticker`, `OrderBookSnapshot`, `Trade`, `Candle`: canonical records

pub mod error;
pub mod market;
pub mod types;

pub use error::{CoreError, Result};
pub use market::{CanonicalSymbol, Exchange, StreamType, Timeframe, Topic};
pub use types::{Candle, MarketEvent, OrderBookSnapshot, PriceLevel, Ticker, Trade, TradeSide};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
