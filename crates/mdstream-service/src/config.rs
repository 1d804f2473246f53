//! Service configuration.

use crate::error::{ServiceError, ServiceResult};
use mdstream_core::{CanonicalSymbol, Exchange, Timeframe};
use mdstream_feed::{TiePolicy, BINANCE_REST_URL, BINANCE_WS_URL, KUCOIN_REST_URL};
use mdstream_ws::{BackoffPolicy, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-exchange streaming configuration.
///
/// `rest_url`, `ws_url` and `rate_limit_capacity` default per exchange,
/// so they stay unset until resolved with the `*_for` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_url: Option<String>,
    /// Fixed WebSocket URL. For KuCoin this bypasses the bullet endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Reattempts before giving up (0 = unlimited).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub heartbeat_enabled: bool,
    /// Client ping interval. KuCoin's bullet response takes precedence.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pool_max_idle_ms")]
    pub pool_max_idle_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_capacity: Option<u32>,
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    #[serde(default = "default_rate_limit_max_wait_ms")]
    pub rate_limit_max_wait_ms: u64,
    /// Symbols used by `subscribe_major_pairs`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Candle timeframes used by `subscribe_major_pairs`.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_close_timeout_ms() -> u64 {
    3_000
}

fn default_heartbeat_interval_ms() -> u64 {
    18_000
}

fn default_pool_size() -> usize {
    2
}

fn default_pool_max_idle_ms() -> u64 {
    60_000
}

fn default_rate_limit_interval_ms() -> u64 {
    1_000
}

fn default_rate_limit_max_wait_ms() -> u64 {
    30_000
}

fn default_symbols() -> Vec<String> {
    ["BTC-USDT", "ETH-USDT", "SOL-USDT", "XRP-USDT", "BNB-USDT"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_timeframes() -> Vec<String> {
    ["1m", "5m", "1h"].into_iter().map(String::from).collect()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rest_url: None,
            ws_url: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: 0,
            connection_timeout_ms: default_connection_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            heartbeat_enabled: true,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            pool_size: default_pool_size(),
            pool_max_idle_ms: default_pool_max_idle_ms(),
            rate_limit_capacity: None,
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            rate_limit_max_wait_ms: default_rate_limit_max_wait_ms(),
            symbols: default_symbols(),
            timeframes: default_timeframes(),
        }
    }
}

impl ExchangeConfig {
    pub fn rest_url_for(&self, exchange: Exchange) -> String {
        self.rest_url.clone().unwrap_or_else(|| {
            match exchange {
                Exchange::Binance => BINANCE_REST_URL,
                Exchange::Kucoin => KUCOIN_REST_URL,
            }
            .to_string()
        })
    }

    /// Fixed WebSocket URL; `None` means resolve through the bullet endpoint.
    pub fn ws_url_for(&self, exchange: Exchange) -> Option<String> {
        match exchange {
            Exchange::Binance => Some(
                self.ws_url
                    .clone()
                    .unwrap_or_else(|| BINANCE_WS_URL.to_string()),
            ),
            Exchange::Kucoin => self.ws_url.clone(),
        }
    }

    pub fn rate_limit_capacity_for(&self, exchange: Exchange) -> u32 {
        self.rate_limit_capacity.unwrap_or(match exchange {
            Exchange::Binance => 5,
            Exchange::Kucoin => 10,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn parsed_symbols(&self) -> ServiceResult<Vec<CanonicalSymbol>> {
        self.symbols
            .iter()
            .map(|s| CanonicalSymbol::parse(s).map_err(ServiceError::from))
            .collect()
    }

    pub fn parsed_timeframes(&self) -> ServiceResult<Vec<Timeframe>> {
        self.timeframes
            .iter()
            .map(|s| s.parse::<Timeframe>().map_err(ServiceError::from))
            .collect()
    }

    /// Streaming parameters for `exchange`.
    pub fn stream_config(&self, exchange: Exchange, staleness: &StalenessConfig) -> StreamConfig {
        StreamConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                jitter: Duration::from_millis(self.reconnect_jitter_ms),
                max_attempts: self.max_reconnect_attempts,
            },
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            heartbeat_enabled: self.heartbeat_enabled,
            pool_size: self.pool_size,
            pool_max_idle: Duration::from_millis(self.pool_max_idle_ms),
            rate_limit_capacity: self.rate_limit_capacity_for(exchange),
            rate_limit_interval: Duration::from_millis(self.rate_limit_interval_ms),
            rate_limit_max_wait: Duration::from_millis(self.rate_limit_max_wait_ms),
            staleness_threshold: Duration::from_millis(staleness.threshold_ms),
            staleness_poll_interval: Duration::from_millis(staleness.poll_interval_ms),
        }
    }

    fn validate(&self, exchange: Exchange) -> ServiceResult<()> {
        let zero = |name: &str| {
            Err(ServiceError::Config(format!(
                "[{exchange}] {name} must be greater than zero"
            )))
        };
        if self.rate_limit_capacity_for(exchange) == 0 {
            return zero("rate_limit_capacity");
        }
        if self.rate_limit_interval_ms == 0 {
            return zero("rate_limit_interval_ms");
        }
        if self.reconnect_base_delay_ms == 0 {
            return zero("reconnect_base_delay_ms");
        }
        if self.connection_timeout_ms == 0 {
            return zero("connection_timeout_ms");
        }
        if self.heartbeat_enabled && self.heartbeat_interval_ms == 0 {
            return zero("heartbeat_interval_ms");
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ServiceError::Config(format!(
                "[{exchange}] reconnect_max_delay_ms is below reconnect_base_delay_ms"
            )));
        }
        self.parsed_symbols()?;
        self.parsed_timeframes()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessConfig {
    #[serde(default = "default_staleness_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_staleness_threshold_ms")]
    pub threshold_ms: u64,
}

fn default_staleness_poll_interval_ms() -> u64 {
    30_000
}

fn default_staleness_threshold_ms() -> u64 {
    120_000
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_staleness_poll_interval_ms(),
            threshold_ms: default_staleness_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default)]
    pub tie_policy: TiePolicy,
}

fn default_aggregator_ttl_ms() -> u64 {
    60_000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_aggregator_ttl_ms(),
            tie_policy: TiePolicy::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Capacity of every broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub binance: ExchangeConfig,
    #[serde(default)]
    pub kucoin: ExchangeConfig,
    #[serde(default)]
    pub staleness: StalenessConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binance: ExchangeConfig::default(),
            kucoin: ExchangeConfig::default(),
            staleness: StalenessConfig::default(),
            aggregator: AggregatorConfig::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &str) -> ServiceResult<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(path = %path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &str) -> ServiceResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ServiceResult<Self> {
        toml::from_str(content)
            .map_err(|e| ServiceError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn exchange(&self, exchange: Exchange) -> &ExchangeConfig {
        match exchange {
            Exchange::Binance => &self.binance,
            Exchange::Kucoin => &self.kucoin,
        }
    }

    pub fn enabled_exchanges(&self) -> Vec<Exchange> {
        Exchange::ALL
            .into_iter()
            .filter(|e| self.exchange(*e).enabled)
            .collect()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Reject zero capacities or intervals and unparsable symbols or timeframes.
    pub fn validate(&self) -> ServiceResult<()> {
        for exchange in self.enabled_exchanges() {
            self.exchange(exchange).validate(exchange)?;
        }
        if self.staleness.poll_interval_ms == 0 || self.staleness.threshold_ms == 0 {
            return Err(ServiceError::Config(
                "staleness intervals must be greater than zero".to_string(),
            ));
        }
        if self.aggregator.ttl_ms == 0 {
            return Err(ServiceError::Config(
                "aggregator.ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ServiceError::Config(
                "health_check_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ServiceError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
