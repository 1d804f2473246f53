//! Market identification types.
//!
//! Every subscription in mdstream is keyed by a `Topic`: the exchange, the
//! stream type, the canonical symbol and (for candles) the timeframe.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Kucoin,
}

impl Exchange {
    /// All supported exchanges.
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::Kucoin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Kucoin => "kucoin",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "kucoin" => Ok(Self::Kucoin),
            other => Err(CoreError::UnknownExchange(other.to_string())),
        }
    }
}

/// Quote currencies recognised when splitting a concatenated symbol
/// such as `BTCUSDT`. Longer suffixes come first so `FDUSD` wins over `USD`.
const KNOWN_QUOTES: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "USD", "EUR", "TRY", "BTC", "ETH", "BNB", "DAI",
];

/// Exchange-neutral symbol, displayed as `BASE-QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalSymbol {
    base: String,
    quote: String,
}

impl CanonicalSymbol {
    /// Build from explicit base and quote assets.
    pub fn new(base: &str, quote: &str) -> Result<Self> {
        let base = base.trim().to_ascii_uppercase();
        let quote = quote.trim().to_ascii_uppercase();
        if !is_asset_code(&base) || !is_asset_code(&quote) {
            return Err(CoreError::InvalidSymbol(format!("{base}-{quote}")));
        }
        Ok(Self { base, quote })
    }

    /// Parse free-form input.
    ///
    /// Accepts `BTC-USDT`, `btc/usdt`, `BTC_USDT`, `BTC:USDT` and the
    /// concatenated `BTCUSDT` form (split on a known quote suffix).
    pub fn parse(input: &str) -> Result<Self> {
        let upper = input.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Err(CoreError::InvalidSymbol("empty symbol".to_string()));
        }

        if let Some((base, quote)) = upper.split_once(['-', '/', '_', ':']) {
            return Self::new(base, quote);
        }

        KNOWN_QUOTES
            .iter()
            .find_map(|q| {
                upper
                    .strip_suffix(q)
                    .filter(|base| !base.is_empty())
                    .map(|base| (base, *q))
            })
            .ok_or_else(|| CoreError::InvalidSymbol(input.to_string()))
            .and_then(|(base, quote)| Self::new(base, quote))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Concatenated form without separator (`BTCUSDT`).
    pub fn concatenated(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

fn is_asset_code(s: &str) -> bool {
    !s.is_empty() && s.len() <= 16 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl FromStr for CanonicalSymbol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CanonicalSymbol {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CanonicalSymbol> for String {
    fn from(s: CanonicalSymbol) -> Self {
        s.to_string()
    }
}

/// Candle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 13] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Interval length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        const MIN: i64 = 60_000;
        match self {
            Self::M1 => MIN,
            Self::M3 => 3 * MIN,
            Self::M5 => 5 * MIN,
            Self::M15 => 15 * MIN,
            Self::M30 => 30 * MIN,
            Self::H1 => 60 * MIN,
            Self::H2 => 120 * MIN,
            Self::H4 => 240 * MIN,
            Self::H6 => 360 * MIN,
            Self::H8 => 480 * MIN,
            Self::H12 => 720 * MIN,
            Self::D1 => 1_440 * MIN,
            Self::W1 => 10_080 * MIN,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == wanted)
            .ok_or_else(|| CoreError::InvalidTimeframe(s.to_string()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Kind of market data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Ticker,
    OrderBook,
    Trade,
    Candle,
}

impl StreamType {
    pub const ALL: [StreamType; 4] = [Self::Ticker, Self::OrderBook, Self::Trade, Self::Candle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::OrderBook => "orderbook",
            Self::Trade => "trade",
            Self::Candle => "candle",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription key: one live session exists per topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub exchange: Exchange,
    pub stream: StreamType,
    pub symbol: CanonicalSymbol,
    pub timeframe: Option<Timeframe>,
}

impl Topic {
    /// Create a topic, enforcing that only candle streams carry a timeframe.
    pub fn new(
        exchange: Exchange,
        stream: StreamType,
        symbol: CanonicalSymbol,
        timeframe: Option<Timeframe>,
    ) -> Result<Self> {
        match (stream, timeframe) {
            (StreamType::Candle, None) => Err(CoreError::InvalidTopic(format!(
                "{exchange}:{stream}:{symbol} requires a timeframe"
            ))),
            (StreamType::Candle, Some(_)) => Ok(Self {
                exchange,
                stream,
                symbol,
                timeframe,
            }),
            (_, Some(tf)) => Err(CoreError::InvalidTopic(format!(
                "{exchange}:{stream}:{symbol} does not take a timeframe ({tf})"
            ))),
            (_, None) => Ok(Self {
                exchange,
                stream,
                symbol,
                timeframe: None,
            }),
        }
    }

    pub fn ticker(exchange: Exchange, symbol: CanonicalSymbol) -> Self {
        Self {
            exchange,
            stream: StreamType::Ticker,
            symbol,
            timeframe: None,
        }
    }

    pub fn order_book(exchange: Exchange, symbol: CanonicalSymbol) -> Self {
        Self {
            exchange,
            stream: StreamType::OrderBook,
            symbol,
            timeframe: None,
        }
    }

    pub fn trades(exchange: Exchange, symbol: CanonicalSymbol) -> Self {
        Self {
            exchange,
            stream: StreamType::Trade,
            symbol,
            timeframe: None,
        }
    }

    pub fn candles(exchange: Exchange, symbol: CanonicalSymbol, timeframe: Timeframe) -> Self {
        Self {
            exchange,
            stream: StreamType::Candle,
            symbol,
            timeframe: Some(timeframe),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.stream, self.symbol)?;
        if let Some(tf) = self.timeframe {
            write!(f, ":{tf}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse_separators() {
        for input in ["BTC-USDT", "btc/usdt", "BTC_USDT", " btc:usdt "] {
            let sym = CanonicalSymbol::parse(input).unwrap();
            assert_eq!(sym.to_string(), "BTC-USDT", "input {input}");
        }
    }

    #[test]
    fn test_symbol_parse_concatenated() {
        assert_eq!(CanonicalSymbol::parse("BTCUSDT").unwrap().to_string(), "BTC-USDT");
        assert_eq!(CanonicalSymbol::parse("ethbtc").unwrap().to_string(), "ETH-BTC");
        assert_eq!(CanonicalSymbol::parse("BTCFDUSD").unwrap().to_string(), "BTC-FDUSD");
    }

    #[test]
    fn test_symbol_parse_rejects_garbage() {
        assert!(CanonicalSymbol::parse("").is_err());
        assert!(CanonicalSymbol::parse("   ").is_err());
        assert!(CanonicalSymbol::parse("USDT").is_err());
        assert!(CanonicalSymbol::parse("XYZ").is_err());
        assert!(CanonicalSymbol::parse("BTC-").is_err());
        assert!(CanonicalSymbol::parse("B$C-USDT").is_err());
    }

    #[test]
    fn test_symbol_serde_as_string() {
        let sym = CanonicalSymbol::parse("sol-usdc").unwrap();
        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "\"SOL-USDC\"");
        let back: CanonicalSymbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sym);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("4H".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("7m".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::H1.duration_ms(), 3_600_000);
    }

    #[test]
    fn test_topic_timeframe_rules() {
        let sym = CanonicalSymbol::parse("BTC-USDT").unwrap();
        assert!(Topic::new(Exchange::Binance, StreamType::Candle, sym.clone(), None).is_err());
        assert!(Topic::new(
            Exchange::Binance,
            StreamType::Ticker,
            sym.clone(),
            Some(Timeframe::M1)
        )
        .is_err());
        let topic = Topic::new(Exchange::Kucoin, StreamType::Candle, sym, Some(Timeframe::M5))
            .unwrap();
        assert_eq!(topic.to_string(), "kucoin:candle:BTC-USDT:5m");
    }

    #[test]
    fn test_exchange_from_str() {
        assert_eq!("Binance".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert!("ftx".parse::<Exchange>().is_err());
    }
}
