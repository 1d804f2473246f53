//! mdstream service layer.
//!
//! - `ServiceConfig`: TOML configuration with per-field defaults
//! - `ExchangeService`: one exchange's streams, health and metrics
//! - `UnifiedService`: every enabled exchange behind one fan-in hub,
//!   with the cross-exchange ticker aggregate

pub mod config;
pub mod error;
pub mod exchange;
pub mod unified;

pub use config::{AggregatorConfig, ExchangeConfig, ServiceConfig, StalenessConfig};
pub use error::{ServiceError, ServiceResult};
pub use exchange::ExchangeService;
pub use unified::UnifiedService;
