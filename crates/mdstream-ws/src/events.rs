//! Event fan-out.
//!
//! One broadcast channel per market record kind plus a lifecycle channel.
//! Consumers hold receivers; dropping a receiver deregisters it. Slow
//! receivers lag and lose the oldest events rather than blocking sessions.

use mdstream_core::{Candle, Exchange, MarketEvent, OrderBookSnapshot, Ticker, Topic, Trade};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::rate_limiter::RateBudgetSnapshot;

/// Session counts and budget for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub exchange: Exchange,
    pub total: usize,
    /// Sessions in `Open` or `Subscribed`.
    pub healthy: usize,
    pub unhealthy: usize,
    pub tickers: usize,
    pub order_books: usize,
    pub trades: usize,
    pub candles: usize,
    pub pool_utilization: f64,
    pub rate_budget: RateBudgetSnapshot,
    pub malformed_frames: u64,
    pub reconnects: u64,
}

impl ConnectionStats {
    /// Health predicate for a running exchange.
    ///
    /// No sessions is healthy. Otherwise at least 80% of sessions must be
    /// up and the rate budget must not be exhausted.
    pub fn is_healthy(&self) -> bool {
        if self.total == 0 {
            return true;
        }
        let ratio = self.healthy as f64 / self.total as f64;
        ratio >= 0.8 && !self.rate_budget.is_exhausted()
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started {
        exchange: Exchange,
    },
    Stopped {
        exchange: Exchange,
    },
    StreamConnected {
        topic: Topic,
    },
    StreamDisconnected {
        topic: Topic,
        code: u16,
        reason: String,
        will_reconnect: bool,
    },
    StreamError {
        topic: Topic,
        message: String,
    },
    StaleData {
        topic: Topic,
        age_ms: u64,
    },
    GaveUp {
        topic: Topic,
        attempts: u32,
    },
    HealthCheck {
        healthy: bool,
        stats: ConnectionStats,
    },
}

impl StreamEvent {
    pub fn exchange(&self) -> Exchange {
        match self {
            Self::Started { exchange } | Self::Stopped { exchange } => *exchange,
            Self::StreamConnected { topic }
            | Self::StreamDisconnected { topic, .. }
            | Self::StreamError { topic, .. }
            | Self::StaleData { topic, .. }
            | Self::GaveUp { topic, .. } => topic.exchange,
            Self::HealthCheck { stats, .. } => stats.exchange,
        }
    }
}

#[derive(Debug)]
pub struct EventHub {
    tickers_tx: broadcast::Sender<Ticker>,
    order_books_tx: broadcast::Sender<OrderBookSnapshot>,
    trades_tx: broadcast::Sender<Trade>,
    candles_tx: broadcast::Sender<Candle>,
    lifecycle_tx: broadcast::Sender<StreamEvent>,
}

impl EventHub {
    /// Every channel gets the same `capacity`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tickers_tx: broadcast::channel(capacity).0,
            order_books_tx: broadcast::channel(capacity).0,
            trades_tx: broadcast::channel(capacity).0,
            candles_tx: broadcast::channel(capacity).0,
            lifecycle_tx: broadcast::channel(capacity).0,
        }
    }

    /// Route a market record to its channel.
    ///
    /// Returns the number of receivers reached (0 when nobody listens).
    pub fn publish_market(&self, event: MarketEvent) -> usize {
        match event {
            MarketEvent::Ticker(t) => self.tickers_tx.send(t).unwrap_or(0),
            MarketEvent::OrderBook(b) => self.order_books_tx.send(b).unwrap_or(0),
            MarketEvent::Trade(t) => self.trades_tx.send(t).unwrap_or(0),
            MarketEvent::Candle(c) => self.candles_tx.send(c).unwrap_or(0),
        }
    }

    pub fn publish(&self, event: StreamEvent) -> usize {
        self.lifecycle_tx.send(event).unwrap_or(0)
    }

    pub fn tickers(&self) -> broadcast::Receiver<Ticker> {
        self.tickers_tx.subscribe()
    }

    pub fn order_books(&self) -> broadcast::Receiver<OrderBookSnapshot> {
        self.order_books_tx.subscribe()
    }

    pub fn trades(&self) -> broadcast::Receiver<Trade> {
        self.trades_tx.subscribe()
    }

    pub fn candles(&self) -> broadcast::Receiver<Candle> {
        self.candles_tx.subscribe()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<StreamEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub fn lifecycle_receiver_count(&self) -> usize {
        self.lifecycle_tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
