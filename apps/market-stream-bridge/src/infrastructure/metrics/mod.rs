//! Prometheus Metrics Module
//!
//! Exposes bridge metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received, malformed frames, control frames sent
//! - **Dispatch**: Messages delivered to subscribers, unknown-topic drops
//! - **Connection**: Status gauge and reconnection attempts
//! - **Subscriptions**: Active topics and bound views
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Without an
//! installed recorder every call here is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_bridge_frames_received_total",
        "Total frames received from the upstream endpoint"
    );
    describe_counter!(
        "market_bridge_frames_malformed_total",
        "Total frames dropped because they could not be decoded"
    );
    describe_counter!(
        "market_bridge_control_frames_sent_total",
        "Total join/leave frames sent upstream"
    );
    describe_counter!(
        "market_bridge_messages_dispatched_total",
        "Total message deliveries to subscriber callbacks"
    );
    describe_counter!(
        "market_bridge_unknown_topic_total",
        "Total messages dropped because no subscription exists for the topic"
    );
    describe_counter!(
        "market_bridge_reconnects_total",
        "Total reconnection attempts"
    );

    describe_gauge!(
        "market_bridge_connection_status",
        "Connection status (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=failed)"
    );
    describe_gauge!(
        "market_bridge_active_topics",
        "Number of topics with at least one subscriber"
    );
    describe_gauge!("market_bridge_bound_views", "Number of bound view states");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Frame encoding label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON text frame.
    Text,
    /// MessagePack binary frame.
    Binary,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

/// Control frame label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Topic join.
    Join,
    /// Topic leave.
    Leave,
}

impl ControlKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }
}

const fn status_value(status: ConnectionStatus) -> f64 {
    match status {
        ConnectionStatus::Disconnected => 0.0,
        ConnectionStatus::Connecting => 1.0,
        ConnectionStatus::Connected => 2.0,
        ConnectionStatus::Reconnecting => 3.0,
        ConnectionStatus::Failed => 4.0,
    }
}

/// Record a frame received from upstream.
pub fn record_frame_received(kind: FrameKind) {
    counter!("market_bridge_frames_received_total", "kind" => kind.as_str()).increment(1);
}

/// Record a frame dropped as malformed.
pub fn record_malformed_frame(kind: FrameKind) {
    counter!("market_bridge_frames_malformed_total", "kind" => kind.as_str()).increment(1);
}

/// Record a control frame sent upstream.
pub fn record_control_frame(kind: ControlKind) {
    counter!("market_bridge_control_frames_sent_total", "action" => kind.as_str()).increment(1);
}

/// Record deliveries to subscriber callbacks.
pub fn record_messages_dispatched(count: u64) {
    counter!("market_bridge_messages_dispatched_total").increment(count);
}

/// Record a message for a topic nobody subscribes to.
pub fn record_unknown_topic() {
    counter!("market_bridge_unknown_topic_total").increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("market_bridge_reconnects_total").increment(1);
}

/// Update the connection status gauge.
pub fn set_connection_status(status: ConnectionStatus) {
    gauge!("market_bridge_connection_status").set(status_value(status));
}

/// Update the active topic count.
pub fn set_active_topics(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("market_bridge_active_topics").set(count as f64);
}

/// Update the bound view count.
pub fn set_bound_views(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("market_bridge_bound_views").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
