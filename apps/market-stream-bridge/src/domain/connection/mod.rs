//! Connection Lifecycle
//!
//! Status values and the bookkeeping record for one logical connection to a
//! market data endpoint.
//!
//! # State Machine
//!
//! ```text
//! disconnected ──► connecting ──► connected ◄──► reconnecting
//!       ▲               │             │               │
//!       │               ▼             ▼               ▼
//!       └────────── failed | disconnected ◄───────────┘
//! ```
//!
//! `failed` is terminal until the endpoint is explicitly re-opened;
//! `disconnected` follows a deliberate close.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// Connection Status
// =============================================================================

/// Status of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No connection, either never opened or deliberately closed.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Link established and usable.
    Connected,
    /// Link lost; waiting out backoff or retrying.
    Reconnecting,
    /// Unrecoverable error (bad endpoint, auth rejected, retries exhausted).
    Failed,
}

impl ConnectionStatus {
    /// Get the lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Check if frames can be sent.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is trying to (re)establish a link.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Check if a transition to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected | Self::Failed, Self::Connecting)
                | (
                    Self::Connecting,
                    Self::Connected | Self::Reconnecting | Self::Failed | Self::Disconnected
                )
                | (
                    Self::Connected,
                    Self::Reconnecting | Self::Failed | Self::Disconnected
                )
                | (
                    Self::Reconnecting,
                    Self::Connected | Self::Failed | Self::Disconnected
                )
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Bookkeeping for one logical connection.
///
/// The session counter increases on every successful (re)connect so that
/// work queued against one link is never replayed onto the next.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Endpoint URL.
    pub endpoint: String,
    /// Current status.
    pub status: ConnectionStatus,
    /// Consecutive reconnection attempts since the last successful connect.
    pub retry_count: u32,
    /// When the current backoff wait ends.
    pub backoff_deadline: Option<Instant>,
    /// Delay of the current backoff wait.
    pub backoff_delay: Option<Duration>,
    /// Successful connect counter.
    pub session: u64,
    /// Most recent error, cleared on connect.
    pub last_error: Option<String>,
    /// When the link was last established.
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// Create state for a fresh, disconnected endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            backoff_deadline: None,
            backoff_delay: None,
            session: 0,
            last_error: None,
            last_connected_at: None,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (leaving state untouched) for disallowed transitions.
    pub fn transition(&mut self, next: ConnectionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Record a successful connect and start a new session.
    pub fn mark_connected(&mut self) -> bool {
        if !self.transition(ConnectionStatus::Connected) {
            return false;
        }
        self.session += 1;
        self.retry_count = 0;
        self.backoff_deadline = None;
        self.backoff_delay = None;
        self.last_error = None;
        self.last_connected_at = Some(Utc::now());
        true
    }

    /// Record the start of a backoff wait before reconnect attempt `attempt`.
    pub fn begin_backoff(&mut self, attempt: u32, delay: Duration) -> bool {
        if self.status != ConnectionStatus::Reconnecting
            && !self.transition(ConnectionStatus::Reconnecting)
        {
            return false;
        }
        self.retry_count = attempt;
        self.backoff_delay = Some(delay);
        self.backoff_deadline = Instant::now().checked_add(delay);
        true
    }

    /// Record a terminal failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(ConnectionStatus::Failed) {
            return false;
        }
        self.last_error = Some(error.into());
        self.backoff_deadline = None;
        self.backoff_delay = None;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
