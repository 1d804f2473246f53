//! Rate limiting for connection and subscription actions.
//!
//! Fixed-window token bucket: `capacity` tokens refill all at once every
//! `interval`, matching exchange quotas of the form "N actions per T
//! seconds". One limiter is shared by every session and the connection
//! pool of an exchange.

use crate::error::{WsError, WsResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct Budget {
    remaining: u32,
    resets_at: Instant,
}

/// Point-in-time view of a rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateBudgetSnapshot {
    pub capacity: u32,
    pub remaining: u32,
    pub resets_in_ms: u64,
}

impl RateBudgetSnapshot {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    /// Tokens per window.
    capacity: u32,
    /// Window length.
    interval: Duration,
    /// Longest `acquire()` may wait before giving up.
    max_wait: Duration,
    budget: Mutex<Budget>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `capacity` - Tokens available per window
    /// * `interval` - Window length; the budget refills fully at each boundary
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self::with_max_wait(capacity, interval, interval.saturating_mul(30))
    }

    pub fn with_max_wait(capacity: u32, interval: Duration, max_wait: Duration) -> Self {
        Self {
            capacity,
            interval,
            max_wait,
            budget: Mutex::new(Budget {
                remaining: capacity,
                resets_at: Instant::now() + interval,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take a token if one is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.take_or_deadline().is_ok()
    }

    /// Take a token, waiting for the next reset boundary while exhausted.
    ///
    /// Fails with `RateLimitExceeded` only if the accumulated wait would
    /// exceed `max_wait`; callers treat that as transient.
    pub async fn acquire(&self) -> WsResult<()> {
        let started = Instant::now();
        loop {
            let resets_at = match self.take_or_deadline() {
                Ok(()) => return Ok(()),
                Err(resets_at) => resets_at,
            };

            let waited = resets_at.saturating_duration_since(started);
            if waited > self.max_wait {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, capacity = self.capacity, "Rate budget wait exceeded");
                return Err(WsError::RateLimitExceeded { waited_ms });
            }

            debug!(
                wait_ms = resets_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate budget exhausted, waiting for reset"
            );
            tokio::time::sleep_until(resets_at).await;
        }
    }

    /// Decrement under the lock, or return the reset deadline when empty.
    fn take_or_deadline(&self) -> Result<(), Instant> {
        let now = Instant::now();
        let mut budget = self.budget.lock();
        self.refill(&mut budget, now);
        if budget.remaining > 0 {
            budget.remaining -= 1;
            Ok(())
        } else {
            Err(budget.resets_at)
        }
    }

    fn refill(&self, budget: &mut Budget, now: Instant) {
        if now >= budget.resets_at {
            budget.remaining = self.capacity;
            // Align to the window grid so bursts cannot straddle two windows.
            let mut next = budget.resets_at + self.interval;
            while next <= now {
                next += self.interval;
            }
            budget.resets_at = next;
        }
    }

    /// Tokens left in the current window.
    pub fn remaining(&self) -> u32 {
        self.snapshot().remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.snapshot().is_exhausted()
    }

    pub fn snapshot(&self) -> RateBudgetSnapshot {
        let now = Instant::now();
        let mut budget = self.budget.lock();
        self.refill(&mut budget, now);
        RateBudgetSnapshot {
            capacity: self.capacity,
            remaining: budget.remaining,
            resets_in_ms: budget.resets_at.saturating_duration_since(now).as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("interval", &self.interval)
            .field("budget", &self.snapshot())
            .finish()
    }
}
