//! Facade over every enabled exchange.
//!
//! Re-emits each exchange's events on one fan-in hub and feeds tickers
//! into the cross-exchange aggregator.

use crate::config::{AggregatorConfig, ServiceConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::exchange::ExchangeService;
use futures_util::future::join_all;
use mdstream_core::{CanonicalSymbol, Exchange, MarketEvent};
use mdstream_feed::{AggregatedTicker, UnifiedAggregator};
use mdstream_telemetry::Metrics;
use mdstream_ws::{ConnectionStats, EventHub};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Forwarding {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct UnifiedService {
    services: BTreeMap<Exchange, Arc<ExchangeService>>,
    aggregator: Arc<UnifiedAggregator>,
    hub: Arc<EventHub>,
    forwarding: Mutex<Option<Forwarding>>,
}

impl UnifiedService {
    /// One `ExchangeService` per enabled exchange.
    pub fn new(config: &ServiceConfig) -> ServiceResult<Self> {
        let services = config
            .enabled_exchanges()
            .into_iter()
            .map(|ex| ExchangeService::new(ex, config))
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(Self::from_services(
            services,
            &config.aggregator,
            config.event_capacity,
        ))
    }

    pub fn from_services(
        services: Vec<ExchangeService>,
        aggregator: &AggregatorConfig,
        event_capacity: usize,
    ) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.exchange(), Arc::new(s)))
                .collect(),
            aggregator: Arc::new(UnifiedAggregator::new(
                aggregator.ttl(),
                aggregator.tie_policy,
            )),
            hub: Arc::new(EventHub::new(event_capacity)),
            forwarding: Mutex::new(None),
        }
    }

    /// Fan-in hub carrying every exchange's events.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn aggregator(&self) -> &Arc<UnifiedAggregator> {
        &self.aggregator
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.services.keys().copied().collect()
    }

    pub fn service(&self, exchange: Exchange) -> ServiceResult<&Arc<ExchangeService>> {
        self.services
            .get(&exchange)
            .ok_or(ServiceError::ExchangeDisabled(exchange))
    }

    pub fn is_running(&self) -> bool {
        self.forwarding.lock().is_some()
    }

    /// Start forwarding, then every exchange service.
    ///
    /// Returns false when already running.
    pub async fn start(&self) -> bool {
        {
            let mut forwarding = self.forwarding.lock();
            if forwarding.is_some() {
                return false;
            }
            let stop = CancellationToken::new();
            // Receivers exist before any service publishes.
            let tasks = self
                .services
                .values()
                .flat_map(|service| self.spawn_forwarders(service, &stop))
                .collect();
            *forwarding = Some(Forwarding { stop, tasks });
        }

        join_all(self.services.values().map(|s| s.start())).await;
        info!(exchanges = ?self.exchanges(), "Unified service started");
        true
    }

    /// Stop every exchange service, then forwarding.
    pub async fn stop(&self) -> bool {
        let Some(forwarding) = self.forwarding.lock().take() else {
            return false;
        };
        join_all(self.services.values().map(|s| s.stop())).await;
        forwarding.stop.cancel();
        for task in forwarding.tasks {
            let _ = task.await;
        }
        self.aggregator.clear();
        Metrics::aggregated_symbols(0);
        info!("Unified service stopped");
        true
    }

    /// `subscribe_major_pairs` on every exchange. Returns new subscriptions.
    pub fn subscribe_major_pairs(&self) -> ServiceResult<usize> {
        let mut added = 0;
        for service in self.services.values() {
            added += service.subscribe_major_pairs()?;
        }
        Ok(added)
    }

    /// Drop `symbol` on every exchange. Returns topics removed.
    pub async fn unsubscribe_symbol(&self, symbol: &str) -> ServiceResult<usize> {
        let mut removed = 0;
        for service in self.services.values() {
            removed += service.unsubscribe_symbol(symbol).await?;
        }
        if let Ok(symbol) = CanonicalSymbol::parse(symbol) {
            self.aggregator.remove(&symbol);
        }
        Ok(removed)
    }

    pub fn get_aggregated_ticker(&self, symbol: &str) -> ServiceResult<Option<AggregatedTicker>> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        Ok(self.aggregator.get(&symbol))
    }

    pub fn aggregated_tickers(&self) -> Vec<AggregatedTicker> {
        self.aggregator.all()
    }

    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.services
            .values()
            .map(|s| s.connection_stats())
            .collect()
    }

    /// Every enabled exchange is healthy.
    pub fn is_healthy(&self) -> bool {
        !self.services.is_empty() && self.services.values().all(|s| s.is_healthy())
    }

    fn spawn_forwarders(
        &self,
        service: &ExchangeService,
        stop: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let source = service.hub();
        let exchange = service.exchange();

        let hub = self.hub.clone();
        let aggregator = self.aggregator.clone();
        let tickers = forward(source.tickers(), exchange, stop.clone(), move |ticker| {
            match aggregator.ingest(&ticker) {
                Ok(_) => Metrics::aggregated_symbols(aggregator.len()),
                Err(e) => warn!(%exchange, error = %e, "Ticker not aggregated"),
            }
            hub.publish_market(MarketEvent::Ticker(ticker));
        });

        let hub = self.hub.clone();
        let books = forward(source.order_books(), exchange, stop.clone(), move |book| {
            hub.publish_market(MarketEvent::OrderBook(book));
        });

        let hub = self.hub.clone();
        let trades = forward(source.trades(), exchange, stop.clone(), move |trade| {
            hub.publish_market(MarketEvent::Trade(trade));
        });

        let hub = self.hub.clone();
        let candles = forward(source.candles(), exchange, stop.clone(), move |candle| {
            hub.publish_market(MarketEvent::Candle(candle));
        });

        let hub = self.hub.clone();
        let lifecycle = forward(source.lifecycle(), exchange, stop.clone(), move |event| {
            hub.publish(event);
        });

        vec![tickers, books, trades, candles, lifecycle]
    }
}

impl std::fmt::Debug for UnifiedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedService")
            .field("exchanges", &self.exchanges())
            .field("running", &self.is_running())
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

/// Drain `rx` into `sink` until `stop` fires or the sender goes away.
fn forward<T, F>(
    mut rx: broadcast::Receiver<T>,
    exchange: Exchange,
    stop: CancellationToken,
    mut sink: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                () = stop.cancelled() => break,
                item = rx.recv() => item,
            };
            match item {
                Ok(item) => sink(item),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%exchange, skipped, "Fan-in lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
