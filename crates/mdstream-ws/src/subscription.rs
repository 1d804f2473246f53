//! Topic subscription lifecycle.
//!
//! `StreamManager` owns every session of one exchange together with the
//! shared rate limiter, connection pool, reconnection table and
//! staleness monitor. One session is kept alive per subscribed topic.

use crate::adapter::ExchangeAdapter;
use crate::endpoint::EndpointProvider;
use crate::error::{WsError, WsResult};
use crate::events::{ConnectionStats, EventHub, StreamEvent};
use crate::heartbeat::StalenessMonitor;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::rate_limiter::RateLimiter;
use crate::reconnect::{BackoffPolicy, ReconnectScheduler};
use crate::session::{Session, SessionState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mdstream_core::{CoreError, Exchange, MarketEvent, StreamType, Topic};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-topic consumer, invoked synchronously in frame order.
pub type EventCallback = Arc<dyn Fn(MarketEvent) + Send + Sync>;

/// Streaming parameters for one exchange.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub backoff: BackoffPolicy,
    pub connection_timeout: Duration,
    pub close_timeout: Duration,
    pub heartbeat_enabled: bool,
    pub pool_size: usize,
    pub pool_max_idle: Duration,
    pub rate_limit_capacity: u32,
    pub rate_limit_interval: Duration,
    pub rate_limit_max_wait: Duration,
    pub staleness_threshold: Duration,
    pub staleness_poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            connection_timeout: Duration::from_millis(10_000),
            close_timeout: Duration::from_millis(3_000),
            heartbeat_enabled: true,
            pool_size: 2,
            pool_max_idle: Duration::from_millis(60_000),
            rate_limit_capacity: 5,
            rate_limit_interval: Duration::from_millis(1_000),
            rate_limit_max_wait: Duration::from_millis(30_000),
            staleness_threshold: Duration::from_millis(120_000),
            staleness_poll_interval: Duration::from_millis(30_000),
        }
    }
}

impl StreamConfig {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            target: self.pool_size,
            max_idle: self.pool_max_idle,
            connection_timeout: self.connection_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// A session for the topic already exists; nothing was spent.
    AlreadySubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    NotSubscribed,
}

pub(crate) struct SessionHandle {
    pub(crate) id: u64,
    state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn state(&self) -> SessionState {
        *self.state.read()
    }
}

/// State shared between the manager and its session tasks.
pub(crate) struct ManagerInner {
    pub(crate) exchange: Exchange,
    pub(crate) config: StreamConfig,
    pub(crate) adapter: Arc<dyn ExchangeAdapter>,
    pub(crate) provider: Arc<dyn EndpointProvider>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) scheduler: ReconnectScheduler,
    pub(crate) staleness: StalenessMonitor,
    pub(crate) sessions: DashMap<Topic, SessionHandle>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) malformed_frames: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    next_session_id: AtomicU64,
}

pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(
        config: StreamConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        provider: Arc<dyn EndpointProvider>,
        hub: Arc<EventHub>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::with_max_wait(
            config.rate_limit_capacity,
            config.rate_limit_interval,
            config.rate_limit_max_wait,
        ));
        let pool = ConnectionPool::new(config.pool_config(), provider.clone(), limiter.clone());
        let inner = ManagerInner {
            exchange: adapter.exchange(),
            scheduler: ReconnectScheduler::new(config.backoff),
            staleness: StalenessMonitor::new(
                config.staleness_threshold,
                config.staleness_poll_interval,
            ),
            config,
            adapter,
            provider,
            limiter,
            pool,
            sessions: DashMap::new(),
            hub,
            malformed_frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.inner.exchange
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.inner.hub
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Fill the connection pool.
    pub async fn warm_pool(&self) -> usize {
        self.inner.pool.warm().await
    }

    /// Start a session for `topic`.
    ///
    /// Returns immediately; connecting happens in the session task and
    /// failures there are reported as lifecycle events. Only validation
    /// errors are returned here.
    pub fn subscribe(&self, topic: Topic, callback: EventCallback) -> WsResult<SubscribeOutcome> {
        if topic.exchange != self.inner.exchange {
            return Err(WsError::Invalid(CoreError::InvalidTopic(format!(
                "{topic} does not belong to {}",
                self.inner.exchange
            ))));
        }
        let topic = Topic::new(topic.exchange, topic.stream, topic.symbol, topic.timeframe)?;

        match self.inner.sessions.entry(topic.clone()) {
            Entry::Occupied(_) => {
                debug!(%topic, "Already subscribed");
                Ok(SubscribeOutcome::AlreadySubscribed)
            }
            Entry::Vacant(vacant) => {
                let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
                let state = Arc::new(RwLock::new(SessionState::Idle));
                let cancel = CancellationToken::new();
                self.inner.staleness.track(&topic);

                let session = Session::new(
                    id,
                    topic.clone(),
                    callback,
                    state.clone(),
                    cancel.clone(),
                    self.inner.clone(),
                );
                let task = tokio::spawn(session.run());
                vacant.insert(SessionHandle {
                    id,
                    state,
                    cancel,
                    task,
                });
                info!(exchange = %self.inner.exchange, %topic, "Subscribed");
                Ok(SubscribeOutcome::Subscribed)
            }
        }
    }

    /// Tear down the session for `topic`, including any pending reconnect.
    pub async fn unsubscribe(&self, topic: &Topic) -> UnsubscribeOutcome {
        let Some((_, handle)) = self.inner.sessions.remove(topic) else {
            return UnsubscribeOutcome::NotSubscribed;
        };
        self.inner.scheduler.cancel(topic);
        self.inner.staleness.remove(topic);
        handle.cancel.cancel();

        let grace = self.inner.config.close_timeout + Duration::from_secs(1);
        let mut task = handle.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(%topic, "Session did not stop in time, aborting");
            task.abort();
        }
        info!(exchange = %self.inner.exchange, %topic, "Unsubscribed");
        UnsubscribeOutcome::Unsubscribed
    }

    /// Unsubscribe every topic concurrently.
    pub async fn unsubscribe_all(&self) -> usize {
        let topics = self.topics();
        let count = topics.len();
        futures_util::future::join_all(topics.iter().map(|t| self.unsubscribe(t))).await;
        count
    }

    /// Unsubscribe everything and close the pool.
    pub async fn shutdown(&self) {
        let count = self.unsubscribe_all().await;
        self.inner.scheduler.cancel_all();
        self.inner.pool.close_all().await;
        info!(exchange = %self.inner.exchange, count, "Stream manager shut down");
    }

    pub fn session_state(&self, topic: &Topic) -> Option<SessionState> {
        self.inner.sessions.get(topic).map(|h| h.state())
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.inner.sessions.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn pending_reconnects(&self) -> usize {
        self.inner.scheduler.pending_count()
    }

    /// Topics currently tracked for staleness.
    pub fn tracked_topics(&self) -> usize {
        self.inner.staleness.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            exchange: self.inner.exchange,
            total: 0,
            healthy: 0,
            unhealthy: 0,
            tickers: 0,
            order_books: 0,
            trades: 0,
            candles: 0,
            pool_utilization: self.inner.pool.utilization(),
            rate_budget: self.inner.limiter.snapshot(),
            malformed_frames: self.inner.malformed_frames.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
        };
        for entry in self.inner.sessions.iter() {
            stats.total += 1;
            if entry.value().state().is_healthy() {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
            match entry.key().stream {
                StreamType::Ticker => stats.tickers += 1,
                StreamType::OrderBook => stats.order_books += 1,
                StreamType::Trade => stats.trades += 1,
                StreamType::Candle => stats.candles += 1,
            }
        }
        stats
    }

    /// Report topics that went stale since the last check.
    pub fn check_staleness(&self) -> usize {
        let stale = self.inner.staleness.check();
        let count = stale.len();
        for entry in stale {
            let age_ms = entry.age.as_millis() as u64;
            warn!(exchange = %self.inner.exchange, topic = %entry.topic, age_ms, "Stale data");
            self.inner.hub.publish(StreamEvent::StaleData {
                topic: entry.topic,
                age_ms,
            });
        }
        count
    }

    /// Run `check_staleness` every poll interval until `stop` fires.
    pub fn spawn_staleness_loop(&self, stop: CancellationToken) -> JoinHandle<()> {
        let manager = Self {
            inner: self.inner.clone(),
        };
        tokio::spawn(async move {
            let every = manager.inner.staleness.poll_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.check_staleness();
                    }
                }
            }
            debug!(exchange = %manager.inner.exchange, "Staleness loop stopped");
        })
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("exchange", &self.inner.exchange)
            .field("sessions", &self.inner.sessions.len())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}
