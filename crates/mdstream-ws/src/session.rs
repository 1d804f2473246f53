//! Per-topic stream session.
//!
//! A session is one long-lived task owning one socket for one topic. It
//! connects, sends the subscribe frame, pumps inbound frames to the
//! topic callback in arrival order and reconnects through the scheduler
//! until it is unsubscribed or gives up.

use crate::adapter::InboundFrame;
use crate::connection::{open_transport, Transport, WsSink, WsSource};
use crate::error::{WsError, WsResult};
use crate::events::StreamEvent;
use crate::heartbeat::HeartbeatTracker;
use crate::reconnect::ScheduleDecision;
use crate::subscription::{EventCallback, ManagerInner};
use futures_util::{SinkExt, StreamExt};
use mdstream_core::{MarketEvent, Topic};
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operator-requested or exchange-initiated clean close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Transport lost without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Exchange reported a terminal error frame for the session.
pub const CLOSE_EXCHANGE_ERROR: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Subscribed,
    Closing,
    Closed,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether the session holds a live transport.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Open | Self::Subscribed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single connection ended.
#[derive(Debug)]
enum SessionEnd {
    Unsubscribed,
    Closed { code: u16, reason: String },
}

pub(crate) struct Session {
    id: u64,
    topic: Topic,
    callback: EventCallback,
    state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    inner: Arc<ManagerInner>,
    next_request_id: u64,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        topic: Topic,
        callback: EventCallback,
        state: Arc<RwLock<SessionState>>,
        cancel: CancellationToken,
        inner: Arc<ManagerInner>,
    ) -> Self {
        Self {
            id,
            topic,
            callback,
            state,
            cancel,
            inner,
            next_request_id: 1,
        }
    }

    pub(crate) async fn run(mut self) {
        // Reattempt index; back to 0 after every successful open.
        let mut attempt: u32 = 0;

        loop {
            self.set_state(SessionState::Connecting);
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            let was_open = connected.is_ok();
            let (code, reason) = match connected {
                Ok(transport) => {
                    attempt = 0;
                    match self.drive(transport).await {
                        SessionEnd::Unsubscribed => break,
                        SessionEnd::Closed { code, reason } => (code, reason),
                    }
                }
                Err(e) => {
                    warn!(
                        exchange = %self.topic.exchange,
                        topic = %self.topic,
                        attempt,
                        error = %e,
                        "Connect failed"
                    );
                    if matches!(e, WsError::Tungstenite(_)) {
                        self.inner.provider.invalidate();
                    }
                    self.inner.hub.publish(StreamEvent::StreamError {
                        topic: self.topic.clone(),
                        message: e.to_string(),
                    });
                    (CLOSE_ABNORMAL, e.to_string())
                }
            };

            self.set_state(SessionState::Closed);
            if self.cancel.is_cancelled() {
                break;
            }

            if code == CLOSE_NORMAL {
                info!(topic = %self.topic, "Stream closed normally by exchange, not reconnecting");
                self.retire();
                self.inner.hub.publish(StreamEvent::StreamDisconnected {
                    topic: self.topic.clone(),
                    code,
                    reason,
                    will_reconnect: false,
                });
                break;
            }

            if was_open {
                warn!(topic = %self.topic, code, %reason, "Stream closed abnormally");
                self.inner.hub.publish(StreamEvent::StreamDisconnected {
                    topic: self.topic.clone(),
                    code,
                    reason,
                    will_reconnect: !self.inner.scheduler.policy().exhausted(attempt),
                });
            }

            match self.inner.scheduler.schedule(&self.topic, attempt) {
                ScheduleDecision::GiveUp { attempts } => {
                    error!(
                        exchange = %self.topic.exchange,
                        topic = %self.topic,
                        attempts,
                        "Reconnect attempts exhausted, giving up"
                    );
                    self.retire();
                    self.inner.hub.publish(StreamEvent::GaveUp {
                        topic: self.topic.clone(),
                        attempts,
                    });
                    break;
                }
                ScheduleDecision::Retry(pending) => {
                    self.set_state(SessionState::Reconnecting);
                    warn!(
                        topic = %self.topic,
                        attempt = pending.attempt(),
                        delay_ms = pending.delay().as_millis() as u64,
                        "Reconnecting"
                    );
                    if !pending.wait_unless(&self.cancel).await {
                        break;
                    }
                    attempt += 1;
                    self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.set_state(SessionState::Closed);
        debug!(topic = %self.topic, session = self.id, "Session task finished");
    }

    async fn connect(&self) -> WsResult<Transport> {
        self.inner.limiter.acquire().await?;
        if let Some(transport) = self.inner.pool.take() {
            debug!(topic = %self.topic, "Using pooled connection");
            return Ok(transport);
        }
        open_transport(
            self.inner.provider.as_ref(),
            self.inner.config.connection_timeout,
        )
        .await
    }

    async fn drive(&mut self, transport: Transport) -> SessionEnd {
        let Transport {
            stream, endpoint, ..
        } = transport;
        let (mut sink, mut source) = stream.split();
        self.set_state(SessionState::Open);

        let request_id = self.next_request_id();
        let subscribe = self
            .inner
            .adapter
            .build_subscribe_frame(&self.topic, request_id);
        if let Err(e) = sink.send(Message::Text(subscribe)).await {
            return SessionEnd::Closed {
                code: CLOSE_ABNORMAL,
                reason: format!("subscribe send failed: {e}"),
            };
        }
        self.set_state(SessionState::Subscribed);
        info!(exchange = %self.topic.exchange, topic = %self.topic, "Stream subscribed");
        self.inner.hub.publish(StreamEvent::StreamConnected {
            topic: self.topic.clone(),
        });

        let ping_interval = if self.inner.config.heartbeat_enabled {
            endpoint.ping_interval
        } else {
            None
        };
        let mut heartbeat = HeartbeatTracker::new();
        let mut pings =
            ping_interval.map(|every| tokio::time::interval_at(Instant::now() + every, every));

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    return self.close(sink, source).await;
                }

                msg = source.next() => {
                    let end = match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text, &mut sink, &mut heartbeat).await
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.err().map(|e| {
                                SessionEnd::Closed {
                                    code: CLOSE_ABNORMAL,
                                    reason: format!("pong send failed: {e}"),
                                }
                            })
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_pong();
                            None
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((CLOSE_NO_STATUS, String::new()));
                            Some(SessionEnd::Closed { code, reason })
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => Some(SessionEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        }),
                        None => Some(SessionEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".to_string(),
                        }),
                    };
                    if let Some(end) = end {
                        return end;
                    }
                }

                () = next_ping(&mut pings) => {
                    let id = self.next_request_id();
                    let ping = match self.inner.adapter.ping_frame(id) {
                        Some(text) => Message::Text(text),
                        None => Message::Ping(Vec::new()),
                    };
                    if let Err(e) = sink.send(ping).await {
                        return SessionEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: format!("ping send failed: {e}"),
                        };
                    }
                    heartbeat.record_ping();
                    debug!(topic = %self.topic, "Sent heartbeat ping");
                }
            }
        }
    }

    /// Classify one text frame. Returns `Some` when the connection must end.
    async fn handle_text(
        &mut self,
        text: &str,
        sink: &mut WsSink,
        heartbeat: &mut HeartbeatTracker,
    ) -> Option<SessionEnd> {
        let parsed = catch_unwind(AssertUnwindSafe(|| {
            self.inner.adapter.parse_frame(&self.topic, text)
        }));
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(panic) => {
                self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %self.topic,
                    panic = %panic_message(&*panic),
                    "Frame parser panicked, frame skipped"
                );
                return None;
            }
        };
        match parsed {
            Ok(InboundFrame::Data(events)) => {
                self.inner.staleness.record(&self.topic);
                for event in events {
                    self.deliver(event);
                }
            }
            Ok(InboundFrame::Welcome { id }) => {
                debug!(topic = %self.topic, ?id, "Welcome received");
            }
            Ok(InboundFrame::Ack { id }) => {
                debug!(topic = %self.topic, ?id, "Subscription acknowledged");
            }
            Ok(InboundFrame::Ping { id }) => {
                if let Some(pong) = self.inner.adapter.pong_frame(id.as_deref()) {
                    if let Err(e) = sink.send(Message::Text(pong)).await {
                        return Some(SessionEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: format!("pong send failed: {e}"),
                        });
                    }
                }
            }
            Ok(InboundFrame::Pong { .. }) => heartbeat.record_pong(),
            Ok(InboundFrame::Error { code, message }) => {
                warn!(topic = %self.topic, ?code, %message, "Exchange reported stream error");
                self.inner.hub.publish(StreamEvent::StreamError {
                    topic: self.topic.clone(),
                    message: message.clone(),
                });
                return Some(SessionEnd::Closed {
                    code: CLOSE_EXCHANGE_ERROR,
                    reason: message,
                });
            }
            Ok(InboundFrame::Unknown(kind)) => {
                self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %self.topic, %kind, "Unclassified frame skipped");
            }
            Err(e) => {
                self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, error = %e, "Malformed frame skipped");
            }
        }
        None
    }

    /// Hand one record to the consumer. A panicking consumer loses that
    /// record only; the session keeps streaming.
    fn deliver(&self, event: MarketEvent) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.callback)(event))) {
            let message = panic_message(&*panic);
            error!(topic = %self.topic, panic = %message, "Stream callback panicked");
            self.inner.hub.publish(StreamEvent::StreamError {
                topic: self.topic.clone(),
                message: format!("callback panicked: {message}"),
            });
        }
    }

    /// Unsubscribe, send a normal close and wait briefly for the ack.
    async fn close(&mut self, mut sink: WsSink, mut source: WsSource) -> SessionEnd {
        self.set_state(SessionState::Closing);

        let request_id = self.next_request_id();
        let unsubscribe = self
            .inner
            .adapter
            .build_unsubscribe_frame(&self.topic, request_id);
        if let Err(e) = sink.send(Message::Text(unsubscribe)).await {
            debug!(topic = %self.topic, error = %e, "Unsubscribe frame not sent");
        }

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "unsubscribe".into(),
        };
        if sink.send(Message::Close(Some(frame))).await.is_ok() {
            let acked = tokio::time::timeout(self.inner.config.close_timeout, async {
                while let Some(Ok(msg)) = source.next().await {
                    if matches!(msg, Message::Close(_)) {
                        return true;
                    }
                }
                false
            })
            .await;
            match acked {
                Ok(true) => debug!(topic = %self.topic, "Close acknowledged"),
                _ => debug!(topic = %self.topic, "No close acknowledgment, forcing close"),
            }
        }

        SessionEnd::Unsubscribed
    }

    /// Drop this session's bookkeeping, unless the topic was already
    /// handed to a newer session.
    fn retire(&self) {
        let removed = self
            .inner
            .sessions
            .remove_if(&self.topic, |_, handle| handle.id == self.id);
        if removed.is_some() {
            self.inner.staleness.remove(&self.topic);
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn next_ping(pings: &mut Option<Interval>) {
    match pings {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_live_states_are_healthy() {
        assert!(SessionState::Open.is_healthy());
        assert!(SessionState::Subscribed.is_healthy());
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Closing,
            SessionState::Closed,
            SessionState::Reconnecting,
        ] {
            assert!(!state.is_healthy(), "{state} should not be healthy");
        }
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        let boxed: Box<dyn Any + Send> = Box::new("bad frame");
        assert_eq!(panic_message(&*boxed), "bad frame");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }
}
