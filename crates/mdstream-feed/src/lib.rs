//! Exchange adapters and cross-exchange aggregation for mdstream.
//!
//! - `BinanceAdapter` / `KucoinAdapter`: wire protocol of each exchange,
//!   plugged into `mdstream_ws::StreamManager`
//! - `UnifiedAggregator`: per-symbol ticker merged across exchanges

pub mod aggregator;
pub mod binance;
pub mod error;
mod fields;
pub mod kucoin;

pub use aggregator::{AggregatedTicker, ExchangeQuote, TiePolicy, UnifiedAggregator};
pub use binance::{BinanceAdapter, BINANCE_REST_URL, BINANCE_WS_URL};
pub use error::{FeedError, FeedResult};
pub use kucoin::{KucoinAdapter, KUCOIN_REST_URL};

use mdstream_core::Exchange;
use mdstream_ws::ExchangeAdapter;
use std::sync::Arc;

/// Adapter for `exchange`.
pub fn adapter_for(exchange: Exchange) -> Arc<dyn ExchangeAdapter> {
    match exchange {
        Exchange::Binance => Arc::new(BinanceAdapter::new()),
        Exchange::Kucoin => Arc::new(KucoinAdapter::new()),
    }
}
