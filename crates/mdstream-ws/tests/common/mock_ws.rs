//! Mock WebSocket exchange for integration tests.
//!
//! Provides a WebSocket server that can:
//! - Accept connections and count them
//! - Acknowledge `SUBSCRIBE` requests
//! - Record every text frame received
//! - Push scripted frames, force an abnormal drop or send a close frame

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Command {
    Text(String),
    /// Drop the TCP stream without a close frame.
    Drop,
    Close(u16),
}

pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    commands: broadcast::Sender<Command>,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
    live: Arc<AtomicU32>,
}

impl MockWsServer {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));
        let live = Arc::new(AtomicU32::new(0));
        let (commands, _) = broadcast::channel(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let live_clone = live.clone();
        let commands_clone = commands.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_connection(
                            stream,
                            messages_clone.clone(),
                            live_clone.clone(),
                            commands_clone.subscribe(),
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
            commands,
            messages,
            connections,
            live,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn received_messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn received_containing(&self, needle: &str) -> usize {
        self.messages.lock().iter().filter(|m| m.contains(needle)).count()
    }

    /// Send a text frame on every open connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Text(text.into()));
    }

    /// Kill every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    /// Close every open connection with `code`.
    pub fn close_connections(&self, code: u16) {
        let _ = self.commands.send(Command::Close(code));
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicU32>,
    mut commands: broadcast::Receiver<Command>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    live.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().push(text.clone());

                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                        if parsed.get("method") == Some(&serde_json::json!("SUBSCRIBE")) {
                            let response = serde_json::json!({
                                "result": null,
                                "id": parsed.get("id").cloned().unwrap_or_default(),
                            });
                            let _ = write.send(Message::Text(response.to_string())).await;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    // Flush the queued close reply.
                    let _ = write.close().await;
                    break;
                }
                Some(Err(_)) | None => break,
                _ => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(Command::Text(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(Command::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Borrowed("server close"),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                Ok(Command::Drop) | Err(_) => break,
            },
        }
    }

    live.fetch_sub(1, Ordering::SeqCst);
}
