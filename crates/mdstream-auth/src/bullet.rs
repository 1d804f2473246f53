//! KuCoin bullet endpoint client.

use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use mdstream_core::CoreError;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// KuCoin's success code.
const CODE_OK: &str = "200000";

/// Short-lived connection credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    /// Instance server URL, normalised to end in `/endpoint`.
    pub endpoint: String,
    pub token: String,
    /// Client ping interval advertised by the server.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Option<Duration>,
    pub fetched_at: Instant,
    /// Token lifetime, when the server states one.
    pub ttl: Option<Duration>,
}

impl ConnectToken {
    /// Whether the token is still usable `margin` before expiry.
    ///
    /// `default_ttl` applies when the server did not send one.
    pub fn is_fresh(&self, now: Instant, default_ttl: Duration, margin: Duration) -> bool {
        let ttl = self.ttl.unwrap_or(default_ttl);
        now.duration_since(self.fetched_at) + margin < ttl
    }
}

/// Anything that can mint a connection token.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch(&self) -> AuthResult<ConnectToken>;
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: String,
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
    #[serde(rename = "instanceServers", default)]
    instance_servers: Vec<InstanceServer>,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InstanceServer {
    endpoint: String,
    #[serde(rename = "pingInterval", default)]
    ping_interval: Option<u64>,
    #[serde(rename = "pingTimeout", default)]
    ping_timeout: Option<u64>,
}

/// Client for `POST {rest_url}/api/v1/bullet-public`.
pub struct BulletClient {
    client: Client,
    url: String,
}

impl BulletClient {
    pub fn new(rest_url: &str) -> AuthResult<Self> {
        Self::with_timeout(rest_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(rest_url: &str, timeout: Duration) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::HttpClient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/api/v1/bullet-public", rest_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for BulletClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulletClient").field("url", &self.url).finish()
    }
}

#[async_trait]
impl TokenSource for BulletClient {
    async fn fetch(&self) -> AuthResult<ConnectToken> {
        debug!(url = %self.url, "Requesting bullet token");
        let response = self
            .client
            .post(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::HttpClient(format!("Failed to read response: {e}")))?;
        let token = parse_bullet(&body, Instant::now())?;
        info!(
            endpoint = %token.endpoint,
            ping_interval_ms = token.ping_interval.map(|d| d.as_millis() as u64),
            "Bullet token acquired"
        );
        Ok(token)
    }
}

fn parse_bullet(body: &str, fetched_at: Instant) -> AuthResult<ConnectToken> {
    let parsed: BulletResponse = serde_json::from_str(body)?;
    if parsed.code != CODE_OK {
        return Err(AuthError::Rejected { code: parsed.code });
    }
    let data = parsed.data.ok_or(AuthError::NoInstanceServer)?;
    if data.token.trim().is_empty() {
        return Err(CoreError::EmptyCredential("kucoin bullet token".to_string()).into());
    }
    let server = data
        .instance_servers
        .into_iter()
        .find(|s| !s.endpoint.trim().is_empty())
        .ok_or(AuthError::NoInstanceServer)?;

    Ok(ConnectToken {
        endpoint: normalize_ws_endpoint(&server.endpoint),
        token: data.token,
        ping_interval: server.ping_interval.map(Duration::from_millis),
        ping_timeout: server.ping_timeout.map(Duration::from_millis),
        fetched_at,
        ttl: data.expires_in.map(Duration::from_millis),
    })
}

/// Bullet responses return the instance URL with or without the
/// `/endpoint` path the connect URL needs.
pub fn normalize_ws_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with("/endpoint") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/endpoint")
    }
}
