//! Prometheus metrics for mdstream.
//!
//! Covers:
//! - Session counts and health per exchange
//! - Reconnects, give-ups and stale topics
//! - Malformed frames and market event throughput
//! - Rate budget and aggregate cache size
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration
//! failure means duplicate metric names, a programming error that should
//! crash at first use. It never happens after initialization.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, IntCounterVec,
    IntGauge, IntGaugeVec, TextEncoder,
};

/// Live stream sessions. Labels: exchange
pub static ACTIVE_SESSIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mdstream_active_sessions",
        "Subscribed stream sessions",
        &["exchange"]
    )
    .unwrap()
});

/// Healthy sessions. Labels: exchange
pub static HEALTHY_SESSIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mdstream_healthy_sessions",
        "Sessions in the open or subscribed state",
        &["exchange"]
    )
    .unwrap()
});

/// Exchange health predicate (1 = healthy).
pub static EXCHANGE_HEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mdstream_exchange_healthy",
        "Exchange service health (1=healthy)",
        &["exchange"]
    )
    .unwrap()
});

pub static RECONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_reconnects_total",
        "Reconnection attempts started",
        &["exchange"]
    )
    .unwrap()
});

pub static GAVE_UP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_gave_up_total",
        "Topics abandoned after exhausting reconnection attempts",
        &["exchange"]
    )
    .unwrap()
});

/// Stale episodes. Labels: exchange, stream
pub static STALE_TOPICS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_stale_topics_total",
        "Stale data episodes detected",
        &["exchange", "stream"]
    )
    .unwrap()
});

pub static STREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_stream_errors_total",
        "Connect failures and exchange error frames",
        &["exchange"]
    )
    .unwrap()
});

pub static MALFORMED_FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_malformed_frames_total",
        "Inbound frames skipped as malformed or unclassifiable",
        &["exchange"]
    )
    .unwrap()
});

/// Canonical records published. Labels: exchange, stream
pub static MARKET_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mdstream_market_events_total",
        "Canonical market records published",
        &["exchange", "stream"]
    )
    .unwrap()
});

pub static RATE_BUDGET_REMAINING: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mdstream_rate_budget_remaining",
        "Connection tokens left in the current window",
        &["exchange"]
    )
    .unwrap()
});

pub static AGGREGATED_SYMBOLS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "mdstream_aggregated_symbols",
        "Live entries in the cross-exchange ticker cache"
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    pub fn sessions(exchange: &str, active: usize, healthy: usize) {
        ACTIVE_SESSIONS
            .with_label_values(&[exchange])
            .set(active as i64);
        HEALTHY_SESSIONS
            .with_label_values(&[exchange])
            .set(healthy as i64);
    }

    pub fn exchange_health(exchange: &str, healthy: bool) {
        EXCHANGE_HEALTHY
            .with_label_values(&[exchange])
            .set(i64::from(healthy));
    }

    /// Raise the reconnect counter to the manager's running `total`.
    pub fn reconnects_observed(exchange: &str, total: u64) {
        sync_counter(&RECONNECTS_TOTAL, &[exchange], total);
    }

    pub fn gave_up(exchange: &str) {
        GAVE_UP_TOTAL.with_label_values(&[exchange]).inc();
    }

    pub fn stale_topic(exchange: &str, stream: &str) {
        STALE_TOPICS_TOTAL
            .with_label_values(&[exchange, stream])
            .inc();
    }

    pub fn stream_error(exchange: &str) {
        STREAM_ERRORS_TOTAL.with_label_values(&[exchange]).inc();
    }

    /// Raise the malformed-frame counter to the manager's running `total`.
    pub fn malformed_frames_observed(exchange: &str, total: u64) {
        sync_counter(&MALFORMED_FRAMES_TOTAL, &[exchange], total);
    }

    pub fn market_event(exchange: &str, stream: &str) {
        MARKET_EVENTS_TOTAL
            .with_label_values(&[exchange, stream])
            .inc();
    }

    pub fn rate_budget(exchange: &str, remaining: u32) {
        RATE_BUDGET_REMAINING
            .with_label_values(&[exchange])
            .set(i64::from(remaining));
    }

    pub fn aggregated_symbols(count: usize) {
        AGGREGATED_SYMBOLS.set(count as i64);
    }
}

/// Counters only move forward; a lower `total` (manager restarted) is ignored.
fn sync_counter(counter: &IntCounterVec, labels: &[&str], total: u64) {
    let c = counter.with_label_values(labels);
    let current = c.get();
    if total > current {
        c.inc_by(total - current);
    }
}

/// Render every registered metric in the text exposition format.
pub fn gather_text() -> TelemetryResult<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
