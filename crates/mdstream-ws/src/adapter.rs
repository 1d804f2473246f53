//! Exchange adapter seam.
//!
//! An adapter owns everything exchange-specific about the wire format:
//! control frames, inbound classification, symbol spelling and interval
//! names. Sessions are generic over it.

use crate::error::FrameError;
use mdstream_core::{CanonicalSymbol, Exchange, MarketEvent, Timeframe, Topic};

/// Classified inbound frame.
///
/// Every frame an exchange sends maps to exactly one variant; shapes the
/// adapter does not recognise land in `Unknown` rather than being coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Server greeting sent right after the handshake.
    Welcome { id: Option<String> },
    /// Acknowledgment of a subscribe/unsubscribe request.
    Ack { id: Option<String> },
    /// Application-level ping that expects a pong frame.
    Ping { id: Option<String> },
    /// Application-level pong answering our ping.
    Pong { id: Option<String> },
    /// One or more canonical records.
    Data(Vec<MarketEvent>),
    /// Terminal error reported by the exchange for this session.
    Error { code: Option<i64>, message: String },
    /// Valid JSON with an unrecognised shape.
    Unknown(String),
}

/// Exchange-specific wire translation.
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// Subscribe control frame for `topic`. `request_id` is unique per
    /// connection and echoed by exchanges that acknowledge requests.
    fn build_subscribe_frame(&self, topic: &Topic, request_id: u64) -> String;

    /// Unsubscribe control frame for `topic`.
    fn build_unsubscribe_frame(&self, topic: &Topic, request_id: u64) -> String;

    /// Classify one text frame received on the session bound to `topic`.
    fn parse_frame(&self, topic: &Topic, text: &str) -> Result<InboundFrame, FrameError>;

    /// Canonical symbol to the exchange's native spelling.
    fn normalize_symbol(&self, symbol: &CanonicalSymbol) -> String;

    /// Inverse of `normalize_symbol`.
    fn canonical_symbol(&self, native: &str) -> Option<CanonicalSymbol>;

    /// Canonical timeframe to the exchange's interval string.
    fn map_timeframe(&self, timeframe: Timeframe) -> &'static str;

    /// Client-initiated ping frame, for exchanges that require one.
    fn ping_frame(&self, _request_id: u64) -> Option<String> {
        None
    }

    /// Reply to an application-level ping from the server.
    fn pong_frame(&self, _id: Option<&str>) -> Option<String> {
        None
    }
}
