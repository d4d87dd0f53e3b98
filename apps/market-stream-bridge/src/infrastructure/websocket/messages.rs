//! Wire Message Types
//!
//! Upstream wire vocabulary: the `type` discriminator on inbound objects and
//! the control requests the bridge sends.
//!
//! # Inbound
//!
//! ```json
//! {"topic":"AAPL.tick","type":"tick","price":150.2,"size":100}
//! {"topic":"AAPL.book","type":"book","bids":[{"price":150.1,"size":3}],"asks":[]}
//! {"topic":"AAPL.status","type":"status","status":"halted"}
//! ```
//!
//! # Outbound
//!
//! ```json
//! {"action":"subscribe","topics":["AAPL.tick"]}
//! ```

use serde::{Deserialize, Serialize};

/// Discriminator carried in the `type` field of inbound objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    /// Trade or quote tick.
    Tick,
    /// Order book delta.
    Book,
    /// Market status event.
    Status,
    /// Subscribe acknowledgement.
    Subscribed,
    /// Unsubscribe acknowledgement.
    Unsubscribed,
    /// Generic acknowledgement.
    Ack,
    /// Server heartbeat.
    Heartbeat,
    /// Application-level pong.
    Pong,
    /// Greeting sent after connect.
    Welcome,
    /// Server-side error notice.
    Error,
}

impl WireType {
    /// Parse a `type` value; unknown values yield `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tick" => Some(Self::Tick),
            "book" => Some(Self::Book),
            "status" => Some(Self::Status),
            "subscribed" => Some(Self::Subscribed),
            "unsubscribed" => Some(Self::Unsubscribed),
            "ack" => Some(Self::Ack),
            "heartbeat" => Some(Self::Heartbeat),
            "pong" => Some(Self::Pong),
            "welcome" => Some(Self::Welcome),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Check if this is a session control message rather than market data.
    #[must_use]
    pub const fn is_control(self) -> bool {
        !matches!(self, Self::Tick | Self::Book | Self::Status)
    }
}

/// Control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start streaming topics.
    Subscribe,
    /// Stop streaming topics.
    Unsubscribe,
}

/// Control request sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Requested action.
    pub action: ControlAction,
    /// Topics the action applies to.
    pub topics: Vec<String>,
}

impl ControlRequest {
    /// Create a subscribe request.
    #[must_use]
    pub const fn subscribe(topics: Vec<String>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topics,
        }
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub const fn unsubscribe(topics: Vec<String>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topics,
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
