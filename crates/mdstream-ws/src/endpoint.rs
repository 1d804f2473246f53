//! Endpoint resolution.
//!
//! Some exchanges accept connections on a fixed URL; others hand out a
//! short-lived endpoint and token over REST first. Sessions and the pool
//! resolve through `EndpointProvider` before every connect.

use crate::error::WsResult;
use async_trait::async_trait;
use std::time::Duration;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsEndpoint {
    /// Full connect URL, including any token query parameters.
    pub url: String,
    /// Client ping interval mandated by the exchange, if any.
    pub ping_interval: Option<Duration>,
}

impl WsEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: None,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }
}

#[async_trait]
pub trait EndpointProvider: Send + Sync + 'static {
    /// Resolve the endpoint for a new connection.
    async fn resolve(&self) -> WsResult<WsEndpoint>;

    /// Drop any cached credential, e.g. after the exchange rejected it.
    fn invalidate(&self) {}
}

/// Fixed endpoint.
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    endpoint: WsEndpoint,
}

impl StaticEndpoint {
    pub fn new(endpoint: WsEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(WsEndpoint::new(url))
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpoint {
    async fn resolve(&self) -> WsResult<WsEndpoint> {
        Ok(self.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_endpoint_resolves_same_url() {
        let provider = StaticEndpoint::new(
            WsEndpoint::new("wss://example.test/ws").with_ping_interval(Duration::from_secs(18)),
        );
        let a = provider.resolve().await.unwrap();
        let b = provider.resolve().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ping_interval, Some(Duration::from_secs(18)));
    }
}
