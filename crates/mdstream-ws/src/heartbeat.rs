//! Heartbeat and staleness tracking.
//!
//! `HeartbeatTracker` is owned by one session and times client pings.
//! `StalenessMonitor` is shared per exchange and tracks, per topic, how
//! long ago data last arrived.

use dashmap::DashMap;
use mdstream_core::Topic;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ping/pong timing for one session.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    last_ping: Option<Instant>,
    waiting_for_pong: bool,
    missed_pongs: u32,
    last_rtt: Option<Duration>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping was sent.
    ///
    /// A ping still unanswered from the previous interval counts as a
    /// missed pong. That is logged only; closure detection is left to the
    /// transport.
    pub fn record_ping(&mut self) {
        if self.waiting_for_pong {
            self.missed_pongs += 1;
            warn!(missed = self.missed_pongs, "No pong since previous ping");
        }
        self.last_ping = Some(Instant::now());
        self.waiting_for_pong = true;
    }

    /// Record that a pong was received.
    pub fn record_pong(&mut self) {
        self.waiting_for_pong = false;
        self.missed_pongs = 0;
        if let Some(ping_time) = self.last_ping {
            let rtt = ping_time.elapsed();
            self.last_rtt = Some(rtt);
            debug!(rtt_ms = rtt.as_millis() as u64, "Received pong");
        }
    }

    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

/// A topic whose data age crossed the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTopic {
    pub topic: Topic,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Freshness {
    last_data: Instant,
    /// Whether this stale episode was already reported.
    flagged: bool,
}

/// Per-topic data age tracking.
///
/// Advisory only: a stale topic is reported, never torn down, since a
/// quiet low-liquidity market is legitimate.
#[derive(Debug)]
pub struct StalenessMonitor {
    threshold: Duration,
    poll_interval: Duration,
    entries: DashMap<Topic, Freshness>,
}

impl StalenessMonitor {
    pub fn new(threshold: Duration, poll_interval: Duration) -> Self {
        Self {
            threshold,
            poll_interval,
            entries: DashMap::new(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Start tracking `topic`; age is measured from now until data arrives.
    pub fn track(&self, topic: &Topic) {
        self.entries.entry(topic.clone()).or_insert(Freshness {
            last_data: Instant::now(),
            flagged: false,
        });
    }

    /// Record that data arrived for `topic`.
    ///
    /// Untracked topics are ignored, so a late frame from a torn-down
    /// session cannot resurrect its entry.
    pub fn record(&self, topic: &Topic) {
        if let Some(mut entry) = self.entries.get_mut(topic) {
            entry.last_data = Instant::now();
            entry.flagged = false;
        }
    }

    pub fn remove(&self, topic: &Topic) {
        self.entries.remove(topic);
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn age(&self, topic: &Topic) -> Option<Duration> {
        self.entries.get(topic).map(|f| f.last_data.elapsed())
    }

    /// Topics that became stale since the previous check.
    ///
    /// Each stale episode is reported once; fresh data re-arms it.
    pub fn check(&self) -> Vec<StaleTopic> {
        let mut stale = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let age = entry.last_data.elapsed();
            if age > self.threshold && !entry.flagged {
                entry.flagged = true;
                stale.push(StaleTopic {
                    topic: entry.key().clone(),
                    age,
                });
            }
        }
        stale
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
