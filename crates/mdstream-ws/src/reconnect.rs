//! Reconnection scheduling.
//!
//! Pending reattempts are entries in a table keyed by topic. A pending
//! entry is claimed by its own timer or removed by `cancel`, both under
//! the same lock, so an attempt that fires after the topic was
//! unsubscribed finds its entry gone and is discarded.

use mdstream_core::Topic;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff with cap and optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of uniform jitter added to each delay (0 disables).
    pub jitter: Duration,
    /// Reattempts allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::ZERO,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reattempt `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        delay + self.jitter_sample()
    }

    /// Whether reattempt `attempt` (0-based) is beyond the cap.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn jitter_sample(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Outcome of asking the scheduler for a reattempt.
#[derive(Debug)]
pub enum ScheduleDecision {
    Retry(PendingReconnect),
    GiveUp { attempts: u32 },
}

#[derive(Debug)]
struct PendingEntry {
    id: u64,
    attempt: u32,
    cancelled: Arc<Notify>,
}

/// Per-exchange table of pending reattempts.
#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: BackoffPolicy,
    pending: Arc<Mutex<HashMap<Topic, PendingEntry>>>,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Register reattempt `attempt` (0-based) for `topic`.
    ///
    /// Replaces any entry already pending for the topic.
    pub fn schedule(&self, topic: &Topic, attempt: u32) -> ScheduleDecision {
        if self.policy.exhausted(attempt) {
            self.pending.lock().remove(topic);
            return ScheduleDecision::GiveUp { attempts: attempt };
        }

        let delay = self.policy.delay(attempt);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        let cancelled = Arc::new(Notify::new());

        let previous = self.pending.lock().insert(
            topic.clone(),
            PendingEntry {
                id,
                attempt,
                cancelled: cancelled.clone(),
            },
        );
        if let Some(prev) = previous {
            prev.cancelled.notify_one();
        }

        debug!(%topic, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        ScheduleDecision::Retry(PendingReconnect {
            topic: topic.clone(),
            id,
            attempt,
            delay,
            due,
            cancelled,
            table: self.pending.clone(),
        })
    }

    /// Remove the pending reattempt for `topic`, if any.
    pub fn cancel(&self, topic: &Topic) -> bool {
        match self.pending.lock().remove(topic) {
            Some(entry) => {
                entry.cancelled.notify_one();
                debug!(%topic, attempt = entry.attempt, "Pending reconnect cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, topic: &Topic) -> bool {
        self.pending.lock().contains_key(topic)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn cancel_all(&self) {
        for (_, entry) in self.pending.lock().drain() {
            entry.cancelled.notify_one();
        }
    }
}

/// Handle to one scheduled reattempt.
#[derive(Debug)]
pub struct PendingReconnect {
    topic: Topic,
    id: u64,
    attempt: u32,
    delay: Duration,
    due: Instant,
    cancelled: Arc<Notify>,
    table: Arc<Mutex<HashMap<Topic, PendingEntry>>>,
}

impl PendingReconnect {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until due, then claim the entry.
    ///
    /// Returns `false` if the entry was cancelled or replaced.
    pub async fn wait(self) -> bool {
        self.wait_unless(&CancellationToken::new()).await
    }

    /// Like `wait`, but also gives up when `stop` fires. The entry is
    /// released in that case so it does not linger in the table.
    pub async fn wait_unless(self, stop: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep_until(self.due) => self.claim(),
            () = self.cancelled.notified() => false,
            () = stop.cancelled() => {
                self.claim();
                false
            }
        }
    }

    /// Remove the entry if it is still ours.
    fn claim(&self) -> bool {
        let mut table = self.table.lock();
        match table.get(&self.topic) {
            Some(entry) if entry.id == self.id => {
                table.remove(&self.topic);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdstream_core::{CanonicalSymbol, Exchange};

    fn topic() -> Topic {
        Topic::ticker(Exchange::Binance, CanonicalSymbol::parse("BTC-USDT").unwrap())
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: Duration::ZERO,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(0);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_millis(1000));
        assert_eq!(p.delay(31), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_bounded() {
        let p = BackoffPolicy {
            jitter: Duration::from_millis(50),
            ..policy(0)
        };
        for _ in 0..20 {
            let d = p.delay(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_spreads_back_to_back_delays() {
        let p = BackoffPolicy {
            jitter: Duration::from_millis(1000),
            ..policy(0)
        };
        let delays: std::collections::HashSet<Duration> = (0..50).map(|_| p.delay(0)).collect();
        assert!(delays.len() > 1, "jitter produced a single value");
    }

    #[test]
    fn test_give_up_at_cap() {
        let scheduler = ReconnectScheduler::new(policy(2));
        assert!(matches!(scheduler.schedule(&topic(), 0), ScheduleDecision::Retry(_)));
        assert!(matches!(scheduler.schedule(&topic(), 1), ScheduleDecision::Retry(_)));
        assert!(matches!(
            scheduler.schedule(&topic(), 2),
            ScheduleDecision::GiveUp { attempts: 2 }
        ));
        assert!(!scheduler.is_pending(&topic()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_claims_entry_after_delay() {
        let scheduler = ReconnectScheduler::new(policy(0));
        let ScheduleDecision::Retry(pending) = scheduler.schedule(&topic(), 1) else {
            panic!("expected retry");
        };
        assert!(scheduler.is_pending(&topic()));
        assert_eq!(pending.delay(), Duration::from_millis(200));

        let start = Instant::now();
        assert!(pending.wait().await);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!scheduler.is_pending(&topic()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_attempt() {
        let scheduler = Arc::new(ReconnectScheduler::new(policy(0)));
        let ScheduleDecision::Retry(pending) = scheduler.schedule(&topic(), 0) else {
            panic!("expected retry");
        };
        let waiter = tokio::spawn(pending.wait());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(scheduler.cancel(&topic()));
        assert!(!waiter.await.unwrap());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_due_but_before_claim_wins() {
        let scheduler = ReconnectScheduler::new(policy(0));
        let ScheduleDecision::Retry(pending) = scheduler.schedule(&topic(), 0) else {
            panic!("expected retry");
        };
        // Timer is already due, but the entry is gone by the time it claims.
        tokio::time::advance(Duration::from_millis(500)).await;
        scheduler.cancel(&topic());
        assert!(!pending.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_token_releases_entry() {
        let scheduler = ReconnectScheduler::new(policy(0));
        let ScheduleDecision::Retry(pending) = scheduler.schedule(&topic(), 3) else {
            panic!("expected retry");
        };
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!pending.wait_unless(&stop).await);
        assert!(!scheduler.is_pending(&topic()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let scheduler = ReconnectScheduler::new(policy(0));
        let ScheduleDecision::Retry(first) = scheduler.schedule(&topic(), 0) else {
            panic!("expected retry");
        };
        let ScheduleDecision::Retry(second) = scheduler.schedule(&topic(), 1) else {
            panic!("expected retry");
        };
        assert!(!first.wait().await);
        assert!(second.wait().await);
    }
}
