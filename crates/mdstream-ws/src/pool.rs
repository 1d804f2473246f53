//! Warm connection pool.
//!
//! Keeps `target` pre-opened transports per exchange so a subscribe does
//! not pay the handshake. Every refill connect spends a token from the
//! exchange's shared rate limiter.

use crate::connection::{open_transport, Transport};
use crate::endpoint::EndpointProvider;
use crate::rate_limiter::RateLimiter;
use futures_util::SinkExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool sizing and connect parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Warm connections to keep available.
    pub target: usize,
    /// Slots older than this are discarded on take. Idle slots are not
    /// pinged, so an endpoint's ping interval caps the age further.
    pub max_idle: Duration,
    pub connection_timeout: Duration,
}

pub struct ConnectionPool {
    config: PoolConfig,
    provider: Arc<dyn EndpointProvider>,
    limiter: Arc<RateLimiter>,
    slots: Mutex<VecDeque<Transport>>,
    /// Refill connects currently in flight.
    refilling: AtomicUsize,
    closed: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn EndpointProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            limiter,
            slots: Mutex::new(VecDeque::with_capacity(config.target)),
            refilling: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn target(&self) -> usize {
        self.config.target
    }

    /// Open connections until `target` are available.
    ///
    /// Connect failures are logged and leave the pool short; returns the
    /// number of connections added.
    pub async fn warm(&self) -> usize {
        if self.closed.swap(false, Ordering::SeqCst) {
            *self.cancel.lock() = CancellationToken::new();
        }
        let mut added = 0;
        while self.available() < self.config.target {
            match self.open_one().await {
                Some(transport) => {
                    self.slots.lock().push_back(transport);
                    added += 1;
                }
                None => break,
            }
        }
        info!(added, available = self.available(), "Connection pool warmed");
        added
    }

    /// Take a warm connection, if one is fresh enough.
    ///
    /// Triggers a background refill either way.
    pub fn take(self: &Arc<Self>) -> Option<Transport> {
        let taken = {
            let mut slots = self.slots.lock();
            let mut found = None;
            while let Some(slot) = slots.pop_front() {
                if slot.opened_at.elapsed() <= self.max_age(&slot) {
                    found = Some(slot);
                    break;
                }
                debug!("Discarding idle pooled connection");
            }
            found
        };
        self.replenish();
        taken
    }

    fn max_age(&self, slot: &Transport) -> Duration {
        match slot.endpoint.ping_interval {
            Some(ping) => ping.min(self.config.max_idle),
            None => self.config.max_idle,
        }
    }

    /// Spawn refill connects for any shortfall below `target`.
    pub fn replenish(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let in_flight = self.refilling.load(Ordering::SeqCst);
            if self.available() + in_flight >= self.config.target {
                return;
            }
            if self
                .refilling
                .compare_exchange(in_flight, in_flight + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let pool = self.clone();
            let cancel = self.cancel.lock().clone();
            tokio::spawn(async move {
                let opened = tokio::select! {
                    opened = pool.open_one() => opened,
                    () = cancel.cancelled() => None,
                };
                if let Some(transport) = opened {
                    if pool.closed.load(Ordering::SeqCst) {
                        drop(transport);
                    } else {
                        pool.slots.lock().push_back(transport);
                    }
                }
                pool.refilling.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn open_one(&self) -> Option<Transport> {
        if let Err(e) = self.limiter.acquire().await {
            warn!(error = %e, "Pool refill skipped, no rate budget");
            return None;
        }
        match open_transport(self.provider.as_ref(), self.config.connection_timeout).await {
            Ok(transport) => Some(transport),
            Err(e) => {
                warn!(error = %e, "Pool connect failed");
                None
            }
        }
    }

    pub fn available(&self) -> usize {
        self.slots.lock().len()
    }

    /// Fraction of the target currently checked out or missing.
    pub fn utilization(&self) -> f64 {
        if self.config.target == 0 {
            return 0.0;
        }
        let available = self.available().min(self.config.target);
        1.0 - available as f64 / self.config.target as f64
    }

    /// Close every pooled connection and stop refilling.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.lock().cancel();
        let drained: Vec<Transport> = self.slots.lock().drain(..).collect();
        let count = drained.len();
        for mut transport in drained {
            if let Err(e) = transport.stream.send(Message::Close(None)).await {
                debug!(error = %e, "Close on pooled connection failed");
            }
        }
        info!(count, "Connection pool closed");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.config.target)
            .field("available", &self.available())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
