//! Cross-exchange ticker aggregation.
//!
//! Keeps the latest ticker each exchange reported for a canonical symbol
//! and derives one `AggregatedTicker` from them. Entries expire `ttl`
//! after their last update; expiry is applied lazily when read.

use crate::error::FeedResult;
use mdstream_core::{CanonicalSymbol, Exchange, Ticker};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rule used to pick the headline fields that cannot be averaged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// The quote with the newest exchange timestamp wins.
    #[default]
    LatestTimestamp,
    /// The quote with the largest 24h volume wins.
    HighestVolume,
}

/// One exchange's contribution to an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeQuote {
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub change_24h_percent: f64,
    pub timestamp_ms: i64,
}

impl From<&Ticker> for ExchangeQuote {
    fn from(t: &Ticker) -> Self {
        Self {
            price: t.price,
            bid: t.bid,
            ask: t.ask,
            volume_24h: t.volume_24h,
            change_24h_percent: t.change_24h_percent,
            timestamp_ms: t.timestamp_ms,
        }
    }
}

/// Ticker merged across exchanges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedTicker {
    pub symbol: CanonicalSymbol,
    /// Mean of the contributing last prices.
    pub average_price: f64,
    pub total_volume_24h: f64,
    /// Highest minus lowest contributing last price.
    pub price_spread: f64,
    /// Highest positive bid, 0 when none.
    pub best_bid: f64,
    /// Lowest positive ask, 0 when none.
    pub best_ask: f64,
    pub primary_exchange: Exchange,
    pub change_24h_percent: f64,
    pub timestamp_ms: i64,
    pub quotes: BTreeMap<Exchange, ExchangeQuote>,
}

impl AggregatedTicker {
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.quotes.keys().copied().collect()
    }
}

struct Entry {
    quotes: BTreeMap<Exchange, ExchangeQuote>,
    aggregate: AggregatedTicker,
    updated_at: Instant,
}

pub struct UnifiedAggregator {
    ttl: Duration,
    policy: TiePolicy,
    entries: RwLock<HashMap<CanonicalSymbol, Entry>>,
}

impl UnifiedAggregator {
    pub fn new(ttl: Duration, policy: TiePolicy) -> Self {
        Self {
            ttl,
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn policy(&self) -> TiePolicy {
        self.policy
    }

    /// Fold a ticker into its symbol's aggregate and return the new value.
    pub fn ingest(&self, ticker: &Ticker) -> FeedResult<AggregatedTicker> {
        ticker.validate()?;
        let now = Instant::now();
        let mut entries = self.entries.write();

        // An expired entry starts over rather than mixing in stale quotes.
        if entries
            .get(&ticker.symbol)
            .is_some_and(|e| now.duration_since(e.updated_at) >= self.ttl)
        {
            debug!(symbol = %ticker.symbol, "Aggregate expired, starting over");
            entries.remove(&ticker.symbol);
        }

        let mut quotes = entries
            .remove(&ticker.symbol)
            .map(|e| e.quotes)
            .unwrap_or_default();
        quotes.insert(ticker.exchange, ExchangeQuote::from(ticker));

        let aggregate = aggregate(&ticker.symbol, &quotes, self.policy);
        entries.insert(
            ticker.symbol.clone(),
            Entry {
                quotes,
                aggregate: aggregate.clone(),
                updated_at: now,
            },
        );
        Ok(aggregate)
    }

    /// Live aggregate for `symbol`; expired entries are evicted.
    pub fn get(&self, symbol: &CanonicalSymbol) -> Option<AggregatedTicker> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(symbol) {
                None => return None,
                Some(e) if now.duration_since(e.updated_at) < self.ttl => {
                    return Some(e.aggregate.clone())
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write();
        if entries
            .get(symbol)
            .is_some_and(|e| now.duration_since(e.updated_at) >= self.ttl)
        {
            entries.remove(symbol);
        }
        None
    }

    /// Every live aggregate, sorted by symbol.
    pub fn all(&self) -> Vec<AggregatedTicker> {
        self.evict_expired();
        let mut out: Vec<_> = self
            .entries
            .read()
            .values()
            .map(|e| e.aggregate.clone())
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.evict_expired();
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, symbol: &CanonicalSymbol) -> bool {
        self.entries.write().remove(symbol).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .retain(|_, e| now.duration_since(e.updated_at) < self.ttl);
    }
}

impl std::fmt::Debug for UnifiedAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedAggregator")
            .field("ttl", &self.ttl)
            .field("policy", &self.policy)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

fn aggregate(
    symbol: &CanonicalSymbol,
    quotes: &BTreeMap<Exchange, ExchangeQuote>,
    policy: TiePolicy,
) -> AggregatedTicker {
    let count = quotes.len().max(1) as f64;
    let average_price = quotes.values().map(|q| q.price).sum::<f64>() / count;
    let total_volume_24h = quotes.values().map(|q| q.volume_24h).sum();
    let max_price = quotes.values().map(|q| q.price).fold(f64::MIN, f64::max);
    let min_price = quotes.values().map(|q| q.price).fold(f64::MAX, f64::min);
    let best_bid = quotes
        .values()
        .map(|q| q.bid)
        .filter(|b| *b > 0.0)
        .fold(0.0, f64::max);
    let best_ask = quotes
        .values()
        .map(|q| q.ask)
        .filter(|a| *a > 0.0)
        .reduce(f64::min)
        .unwrap_or(0.0);

    // Ties keep the first exchange in `Exchange` order.
    let headline = quotes.iter().reduce(|best, cand| {
        let better = match policy {
            TiePolicy::LatestTimestamp => cand.1.timestamp_ms > best.1.timestamp_ms,
            TiePolicy::HighestVolume => cand.1.volume_24h > best.1.volume_24h,
        };
        if better {
            cand
        } else {
            best
        }
    });
    let (primary_exchange, change_24h_percent, timestamp_ms) = match headline {
        Some((ex, q)) => (*ex, q.change_24h_percent, q.timestamp_ms),
        None => (Exchange::Binance, 0.0, 0),
    };

    AggregatedTicker {
        symbol: symbol.clone(),
        average_price,
        total_volume_24h,
        price_spread: if quotes.is_empty() { 0.0 } else { max_price - min_price },
        best_bid,
        best_ask,
        primary_exchange,
        change_24h_percent,
        timestamp_ms,
        quotes: quotes.clone(),
    }
}
