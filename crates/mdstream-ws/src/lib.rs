//! WebSocket streaming core for exchange market data.
//!
//! Provides per-topic streaming sessions with:
//! - One long-lived task per topic, frames delivered in arrival order
//! - Exponential backoff reconnection with atomic cancellation
//! - Fixed-window rate limiting shared by sessions and the pool
//! - Warm connection pooling
//! - Heartbeat pings and staleness detection
//! - Broadcast fan-out of records and lifecycle events

pub mod adapter;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod pool;
pub mod rate_limiter;
pub mod reconnect;
pub mod session;
pub mod subscription;

pub use adapter::{ExchangeAdapter, InboundFrame};
pub use connection::{open_transport, Transport, WsStream};
pub use endpoint::{EndpointProvider, StaticEndpoint, WsEndpoint};
pub use error::{FrameError, WsError, WsResult};
pub use events::{ConnectionStats, EventHub, StreamEvent};
pub use heartbeat::{HeartbeatTracker, StaleTopic, StalenessMonitor};
pub use pool::{ConnectionPool, PoolConfig};
pub use rate_limiter::{RateBudgetSnapshot, RateLimiter};
pub use reconnect::{BackoffPolicy, PendingReconnect, ReconnectScheduler, ScheduleDecision};
pub use session::{
    SessionState, CLOSE_ABNORMAL, CLOSE_EXCHANGE_ERROR, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use subscription::{
    EventCallback, StreamConfig, StreamManager, SubscribeOutcome, UnsubscribeOutcome,
};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Install the rustls crypto provider.
/// Must be called before any TLS WebSocket connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
