//! Transport connections.

use crate::endpoint::{EndpointProvider, WsEndpoint};
use crate::error::{WsError, WsResult};
use futures_util::stream::{SplitSink, SplitStream};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Upgraded WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// An established transport plus the endpoint it was opened against.
pub struct Transport {
    pub stream: WsStream,
    pub endpoint: WsEndpoint,
    pub opened_at: Instant,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Resolve an endpoint and open a transport, bounded by `timeout`.
pub async fn open_transport(
    provider: &dyn EndpointProvider,
    timeout: Duration,
) -> WsResult<Transport> {
    let endpoint = provider.resolve().await?;
    debug!(url = %redact(&endpoint.url), "Opening WebSocket transport");

    // TCP_NODELAY for lower latency
    let connect = connect_async_tls_with_config(endpoint.url.as_str(), None, true, None);
    let (stream, _response) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| WsError::ConnectTimeout(timeout.as_millis() as u64))??;

    Ok(Transport {
        stream,
        endpoint,
        opened_at: Instant::now(),
    })
}

/// Strip query parameters, which may carry tokens, before logging a URL.
pub fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
