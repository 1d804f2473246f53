//! Cached bullet-token endpoint provider.

use crate::bullet::{BulletClient, ConnectToken, TokenSource};
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use mdstream_core::now_ms;
use mdstream_ws::{EndpointProvider, WsEndpoint, WsResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BulletConfig {
    pub rest_url: String,
    pub request_timeout: Duration,
    /// Refresh this long before the token expires.
    pub refresh_margin: Duration,
    /// Lifetime assumed when the server does not state one.
    pub default_ttl: Duration,
    /// Ping interval used when the server does not advertise one.
    pub default_ping_interval: Duration,
}

impl Default for BulletConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.kucoin.com".to_string(),
            request_timeout: Duration::from_secs(10),
            refresh_margin: Duration::from_secs(60),
            default_ttl: Duration::from_secs(24 * 60 * 60),
            default_ping_interval: Duration::from_millis(18_000),
        }
    }
}

pub struct BulletTokenProvider {
    config: BulletConfig,
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<ConnectToken>>,
    /// Serialises refreshes so concurrent connects share one REST call.
    refresh: tokio::sync::Mutex<()>,
    next_connect_id: AtomicU64,
}

impl BulletTokenProvider {
    pub fn new(config: BulletConfig) -> AuthResult<Self> {
        let client = BulletClient::with_timeout(&config.rest_url, config.request_timeout)?;
        Ok(Self::with_source(config, Arc::new(client)))
    }

    pub fn with_source(config: BulletConfig, source: Arc<dyn TokenSource>) -> Self {
        Self {
            config,
            source,
            cached: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            next_connect_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BulletConfig {
        &self.config
    }

    fn fresh_cached(&self) -> Option<ConnectToken> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|t| {
                t.is_fresh(
                    Instant::now(),
                    self.config.default_ttl,
                    self.config.refresh_margin,
                )
            })
            .cloned()
    }

    /// Current token, fetching a new one when missing or near expiry.
    pub async fn token(&self) -> AuthResult<ConnectToken> {
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }
        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }
        let token = self.source.fetch().await?;
        *self.cached.lock() = Some(token.clone());
        Ok(token)
    }

    pub fn has_cached_token(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// Connect URL for `token` with a fresh `connectId`.
    fn connect_url(&self, token: &ConnectToken) -> AuthResult<String> {
        let connect_id = format!(
            "mds{}{}",
            now_ms(),
            self.next_connect_id.fetch_add(1, Ordering::Relaxed)
        );
        let url = reqwest::Url::parse_with_params(
            &token.endpoint,
            &[("token", token.token.as_str()), ("connectId", connect_id.as_str())],
        )
        .map_err(|e| AuthError::HttpClient(format!("Invalid instance endpoint: {e}")))?;
        Ok(url.to_string())
    }
}

impl std::fmt::Debug for BulletTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulletTokenProvider")
            .field("config", &self.config)
            .field("cached", &self.has_cached_token())
            .finish()
    }
}

#[async_trait]
impl EndpointProvider for BulletTokenProvider {
    async fn resolve(&self) -> WsResult<WsEndpoint> {
        let token = self.token().await.map_err(|e| {
            warn!(error = %e, "Bullet token unavailable");
            e
        })?;
        let url = self.connect_url(&token)?;
        let ping_interval = token
            .ping_interval
            .unwrap_or(self.config.default_ping_interval);
        Ok(WsEndpoint::new(url).with_ping_interval(ping_interval))
    }

    fn invalidate(&self) {
        if self.cached.lock().take().is_some() {
            debug!("Bullet token invalidated");
        }
    }
}
