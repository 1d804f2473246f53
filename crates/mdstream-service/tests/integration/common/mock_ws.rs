//! Mock exchange WebSocket server for integration tests.
//!
//! Speaks just enough of each exchange's control protocol:
//! - Binance: answers `SUBSCRIBE` with `{"result":null,"id":..}`
//! - KuCoin: sends `welcome` on connect, acks `subscribe`, answers `ping`
//!
//! Scripted frames can be pushed to every open connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Binance,
    Kucoin,
}

pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    push_tx: broadcast::Sender<String>,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a mock server on an available port.
    pub async fn start(dialect: Dialect) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (push_tx, _) = broadcast::channel::<String>(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let push_clone = push_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            dialect,
                            messages_clone.clone(),
                            connections_clone.clone(),
                            push_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            push_tx,
            messages,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Completed WebSocket handshakes.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.iter().cloned().collect()
    }

    /// Send `text` on every open connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(text.into());
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn reply(dialect: Dialect, parsed: &Value) -> Option<Value> {
    match dialect {
        Dialect::Binance if parsed.get("method") == Some(&json!("SUBSCRIBE")) => Some(json!({
            "result": null,
            "id": parsed.get("id").cloned().unwrap_or_default(),
        })),
        Dialect::Kucoin => match parsed.get("type").and_then(Value::as_str) {
            Some("subscribe") => Some(json!({"id": parsed["id"], "type": "ack"})),
            Some("ping") => Some(json!({"id": parsed["id"], "type": "pong"})),
            _ => None,
        },
        _ => None,
    }
}

async fn handle_connection(
    stream: TcpStream,
    dialect: Dialect,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    mut pushes: broadcast::Receiver<String>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let (mut write, mut read) = ws_stream.split();
    if dialect == Dialect::Kucoin {
        let welcome = json!({"id": "welcome-1", "type": "welcome"});
        let _ = write.send(Message::Text(welcome.to_string())).await;
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push_back(text.clone());
                    if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                        if let Some(response) = reply(dialect, &parsed) {
                            let _ = write.send(Message::Text(response.to_string())).await;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    let _ = write.close().await;
                    break;
                }
                Some(Err(_)) | None => break,
                _ => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok(text) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
