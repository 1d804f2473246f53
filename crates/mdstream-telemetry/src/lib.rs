//! Prometheus metrics and structured logging for mdstream.
//!
//! - `init_logging`: tracing subscriber, JSON in production
//! - `Metrics`: session, reconnect, staleness and throughput metrics,
//!   rendered with `gather_text`

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::{gather_text, Metrics};
