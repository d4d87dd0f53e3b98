//! Market Data Messages
//!
//! Core domain types for inbound market data: ticks, order book deltas and
//! status events, each tagged with the topic it was published on.
//! These types are codec-agnostic; the wire decoder maps frames onto them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A topic key (e.g. `AAPL.tick`).
pub type Topic = String;

// =============================================================================
// Payloads
// =============================================================================

/// A last-trade / quote tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Last traded price.
    pub price: Decimal,
    /// Traded size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    /// Best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Exchange timestamp, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size (zero removes the level).
    pub size: Decimal,
}

/// Incremental order book update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Changed bid levels.
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    /// Changed ask levels.
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    /// Upstream sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl BookDelta {
    /// Highest bid in this delta with non-zero size.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| l.price)
            .max()
    }

    /// Lowest ask in this delta with non-zero size.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| l.price)
            .min()
    }
}

/// Market or instrument status event (halts, session changes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Status code or name.
    pub status: String,
    /// Human readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Decoded payload of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MarketPayload {
    /// Trade or quote tick.
    Tick(Tick),
    /// Order book delta.
    BookDelta(BookDelta),
    /// Status event.
    Status(StatusEvent),
    /// Payload shape not recognised; kept verbatim.
    Other(serde_json::Value),
}

impl MarketPayload {
    /// Short name of the payload kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tick(_) => "tick",
            Self::BookDelta(_) => "book_delta",
            Self::Status(_) => "status",
            Self::Other(_) => "other",
        }
    }

    /// Price carried by the payload, if any.
    ///
    /// For book deltas this is the mid of the best bid and ask when both
    /// sides are present and their sum is representable.
    #[must_use]
    pub fn price(&self) -> Option<Decimal> {
        match self {
            Self::Tick(tick) => Some(tick.price),
            Self::BookDelta(delta) => match (delta.best_bid(), delta.best_ask()) {
                (Some(bid), Some(ask)) => bid.checked_add(ask).map(|sum| sum / Decimal::TWO),
                _ => None,
            },
            Self::Status(_) | Self::Other(_) => None,
        }
    }
}

// =============================================================================
// Inbound Message
// =============================================================================

/// One decoded message, routed by topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: Topic,
    /// Decoded payload.
    pub payload: MarketPayload,
    /// When the frame carrying this message arrived.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<Topic>, payload: MarketPayload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Convenience constructor for a tick carrying only a price.
    #[must_use]
    pub fn tick(topic: impl Into<Topic>, price: Decimal) -> Self {
        Self::new(
            topic,
            MarketPayload::Tick(Tick {
                price,
                size: None,
                bid: None,
                ask: None,
                timestamp: None,
            }),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
