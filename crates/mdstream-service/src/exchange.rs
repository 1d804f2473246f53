//! Per-exchange facade.
//!
//! Owns one `StreamManager` plus the background loops that make it a
//! service: staleness polling, periodic health checks and metrics
//! recording from lifecycle events.

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use mdstream_auth::{BulletConfig, BulletTokenProvider};
use mdstream_core::{CanonicalSymbol, Exchange, MarketEvent, Timeframe, Topic};
use mdstream_feed::adapter_for;
use mdstream_telemetry::Metrics;
use mdstream_ws::{
    ConnectionStats, EndpointProvider, EventCallback, EventHub, ExchangeAdapter, StaticEndpoint,
    StreamConfig, StreamEvent, StreamManager, SubscribeOutcome, WsEndpoint,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background tasks of a running service.
struct Running {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ExchangeService {
    exchange: Exchange,
    manager: Arc<StreamManager>,
    hub: Arc<EventHub>,
    symbols: Vec<CanonicalSymbol>,
    timeframes: Vec<Timeframe>,
    health_check_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl ExchangeService {
    /// Build the service for `exchange` from configuration.
    pub fn new(exchange: Exchange, config: &ServiceConfig) -> ServiceResult<Self> {
        let ex = config.exchange(exchange);
        let provider: Arc<dyn EndpointProvider> = match ex.ws_url_for(exchange) {
            Some(url) => {
                let endpoint = WsEndpoint::new(url);
                // Binance pings the client; only KuCoin needs client pings.
                let endpoint = if exchange == Exchange::Kucoin {
                    endpoint.with_ping_interval(ex.heartbeat_interval())
                } else {
                    endpoint
                };
                Arc::new(StaticEndpoint::new(endpoint))
            }
            None => Arc::new(BulletTokenProvider::new(BulletConfig {
                rest_url: ex.rest_url_for(exchange),
                default_ping_interval: ex.heartbeat_interval(),
                ..BulletConfig::default()
            })?),
        };
        Ok(Self::with_parts(
            ex.stream_config(exchange, &config.staleness),
            adapter_for(exchange),
            provider,
            Arc::new(EventHub::new(config.event_capacity)),
            ex.parsed_symbols()?,
            ex.parsed_timeframes()?,
            config.health_check_interval(),
        ))
    }

    /// Assemble from explicit parts.
    pub fn with_parts(
        stream_config: StreamConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        provider: Arc<dyn EndpointProvider>,
        hub: Arc<EventHub>,
        symbols: Vec<CanonicalSymbol>,
        timeframes: Vec<Timeframe>,
        health_check_interval: Duration,
    ) -> Self {
        let exchange = adapter.exchange();
        let manager = StreamManager::new(stream_config, adapter, provider, hub.clone());
        Self {
            exchange,
            manager: Arc::new(manager),
            hub,
            symbols,
            timeframes,
            health_check_interval,
            running: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Warm the pool and start the background loops.
    ///
    /// Returns false when already running.
    pub async fn start(&self) -> bool {
        let stop = {
            let mut running = self.running.lock();
            if running.is_some() {
                return false;
            }
            let stop = CancellationToken::new();
            let tasks = vec![self.spawn_metrics_recorder(stop.clone())];
            *running = Some(Running {
                stop: stop.clone(),
                tasks,
            });
            stop
        };

        let warmed = self.manager.warm_pool().await;
        let tasks = [
            self.manager.spawn_staleness_loop(stop.clone()),
            self.spawn_health_loop(stop),
        ];
        if let Some(running) = self.running.lock().as_mut() {
            running.tasks.extend(tasks);
        }

        info!(exchange = %self.exchange, warmed, "Exchange service started");
        self.hub.publish(StreamEvent::Started {
            exchange: self.exchange,
        });
        true
    }

    /// Unsubscribe everything, close the pool and stop the loops.
    ///
    /// Returns false when not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        self.manager.shutdown().await;
        running.stop.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        Metrics::sessions(self.exchange.as_str(), 0, 0);
        Metrics::exchange_health(self.exchange.as_str(), false);

        info!(exchange = %self.exchange, "Exchange service stopped");
        self.hub.publish(StreamEvent::Stopped {
            exchange: self.exchange,
        });
        true
    }

    fn ensure_running(&self) -> ServiceResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ServiceError::NotRunning(self.exchange))
        }
    }

    fn callback(&self) -> EventCallback {
        let hub = self.hub.clone();
        Arc::new(move |event: MarketEvent| {
            Metrics::market_event(event.exchange().as_str(), event.stream_type().as_str());
            hub.publish_market(event);
        })
    }

    /// The running lock is held across the subscribe so `stop` cannot
    /// finish its shutdown in between and leave a session behind.
    fn subscribe(&self, topic: Topic) -> ServiceResult<SubscribeOutcome> {
        let running = self.running.lock();
        if running.is_none() {
            return Err(ServiceError::NotRunning(self.exchange));
        }
        let outcome = self.manager.subscribe(topic, self.callback())?;
        drop(running);
        Ok(outcome)
    }

    pub fn subscribe_ticker(&self, symbol: &str) -> ServiceResult<SubscribeOutcome> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        self.subscribe(Topic::ticker(self.exchange, symbol))
    }

    pub fn subscribe_order_book(&self, symbol: &str) -> ServiceResult<SubscribeOutcome> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        self.subscribe(Topic::order_book(self.exchange, symbol))
    }

    pub fn subscribe_trades(&self, symbol: &str) -> ServiceResult<SubscribeOutcome> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        self.subscribe(Topic::trades(self.exchange, symbol))
    }

    pub fn subscribe_candles(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> ServiceResult<SubscribeOutcome> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        let timeframe: Timeframe = timeframe.parse()?;
        self.subscribe(Topic::candles(self.exchange, symbol, timeframe))
    }

    /// Every stream type for every configured symbol; candles for every
    /// configured timeframe. Returns the number of new subscriptions.
    pub fn subscribe_major_pairs(&self) -> ServiceResult<usize> {
        self.ensure_running()?;
        let mut topics = Vec::new();
        for symbol in &self.symbols {
            topics.push(Topic::ticker(self.exchange, symbol.clone()));
            topics.push(Topic::order_book(self.exchange, symbol.clone()));
            topics.push(Topic::trades(self.exchange, symbol.clone()));
            for tf in &self.timeframes {
                topics.push(Topic::candles(self.exchange, symbol.clone(), *tf));
            }
        }
        let mut added = 0;
        for topic in topics {
            if self.subscribe(topic)? == SubscribeOutcome::Subscribed {
                added += 1;
            }
        }
        info!(exchange = %self.exchange, added, "Subscribed major pairs");
        Ok(added)
    }

    /// Drop every topic of `symbol`. Returns how many were removed.
    pub async fn unsubscribe_symbol(&self, symbol: &str) -> ServiceResult<usize> {
        let symbol = CanonicalSymbol::parse(symbol)?;
        let topics: Vec<Topic> = self
            .manager
            .topics()
            .into_iter()
            .filter(|t| t.symbol == symbol)
            .collect();
        for topic in &topics {
            self.manager.unsubscribe(topic).await;
        }
        Ok(topics.len())
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    /// False while stopped; otherwise the stats health predicate.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.manager.stats().is_healthy()
    }

    fn spawn_health_loop(&self, stop: CancellationToken) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let hub = self.hub.clone();
        let every = self.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = manager.stats();
                        let healthy = stats.is_healthy();
                        debug!(exchange = %stats.exchange, healthy, total = stats.total, "Health check");
                        hub.publish(StreamEvent::HealthCheck { healthy, stats });
                    }
                }
            }
        })
    }

    fn spawn_metrics_recorder(&self, stop: CancellationToken) -> JoinHandle<()> {
        let mut events = self.hub.lifecycle();
        let exchange = self.exchange;
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = stop.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%exchange, skipped, "Metrics recorder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn record(event: &StreamEvent) {
    let exchange = event.exchange();
    match event {
        StreamEvent::StreamError { .. } => Metrics::stream_error(exchange.as_str()),
        StreamEvent::GaveUp { .. } => Metrics::gave_up(exchange.as_str()),
        StreamEvent::StaleData { topic, .. } => {
            Metrics::stale_topic(exchange.as_str(), topic.stream.as_str())
        }
        StreamEvent::HealthCheck { healthy, stats } => {
            let name = exchange.as_str();
            Metrics::sessions(name, stats.total, stats.healthy);
            Metrics::exchange_health(name, *healthy);
            Metrics::reconnects_observed(name, stats.reconnects);
            Metrics::malformed_frames_observed(name, stats.malformed_frames);
            Metrics::rate_budget(name, stats.rate_budget.remaining);
        }
        StreamEvent::Started { .. }
        | StreamEvent::Stopped { .. }
        | StreamEvent::StreamConnected { .. }
        | StreamEvent::StreamDisconnected { .. } => {}
    }
}

impl std::fmt::Debug for ExchangeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeService")
            .field("exchange", &self.exchange)
            .field("running", &self.is_running())
            .field("topics", &self.manager.topics().len())
            .finish()
    }
}
