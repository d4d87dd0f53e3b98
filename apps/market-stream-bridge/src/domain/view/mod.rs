//! View State
//!
//! The UI-facing snapshot for one bound topic: latest value, when it
//! arrived, and the status of the connection feeding it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::connection::ConnectionStatus;
use super::market::{InboundMessage, MarketPayload, Topic};

/// Status shown by a bound view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewStatus {
    /// Bound, nothing received yet.
    Loading,
    /// First connection attempt in progress.
    Connecting,
    /// Live data.
    Connected,
    /// Link lost; data may be stale.
    Reconnecting,
    /// Connection closed.
    Disconnected,
    /// Connection failed permanently.
    Failed,
}

impl ViewStatus {
    /// Check if the view should render a degraded-state indicator.
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Disconnected | Self::Failed)
    }
}

impl From<ConnectionStatus> for ViewStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Disconnected => Self::Disconnected,
            ConnectionStatus::Connecting => Self::Connecting,
            ConnectionStatus::Connected => Self::Connected,
            ConnectionStatus::Reconnecting => Self::Reconnecting,
            ConnectionStatus::Failed => Self::Failed,
        }
    }
}

/// Latest data and connection status for one binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    /// Bound topic.
    pub topic: Topic,
    /// Displayed status.
    pub status: ViewStatus,
    /// Latest decoded payload.
    pub value: Option<MarketPayload>,
    /// Latest price derived from the payload, kept across non-price payloads.
    pub last_price: Option<Decimal>,
    /// When the latest payload arrived.
    pub updated_at: Option<DateTime<Utc>>,
    /// Error text while the connection is failed.
    pub error: Option<String>,
    /// Number of payloads applied.
    pub update_count: u64,
}

impl ViewState {
    /// Initial state for a fresh binding.
    #[must_use]
    pub fn loading(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            status: ViewStatus::Loading,
            value: None,
            last_price: None,
            updated_at: None,
            error: None,
            update_count: 0,
        }
    }

    /// Apply a delivered message observed while the connection is `status`.
    pub fn apply_message(&mut self, message: &InboundMessage, status: ConnectionStatus) {
        if let Some(price) = message.payload.price() {
            self.last_price = Some(price);
        }
        self.value = Some(message.payload.clone());
        self.updated_at = Some(message.received_at);
        self.status = status.into();
        self.update_count += 1;
    }

    /// Mirror a connection status change.
    ///
    /// A view without data stays `loading` while the connection is coming
    /// up or healthy; degraded statuses always show.
    pub fn apply_status(&mut self, status: ConnectionStatus, error: Option<&str>) {
        let waiting = !self.has_value()
            && matches!(
                status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            );
        self.status = if waiting {
            ViewStatus::Loading
        } else {
            status.into()
        };
        self.error = match status {
            ConnectionStatus::Failed => error.map(ToString::to_string),
            _ => None,
        };
    }

    /// Check if the view has received any data.
    #[must_use]
    pub const fn has_value(&self) -> bool {
        self.value.is_some()
    }
}
