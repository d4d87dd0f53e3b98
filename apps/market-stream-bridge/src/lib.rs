#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Stream Bridge - Realtime Market Data Subscriptions
//!
//! Keeps one shared realtime connection to a market data endpoint, routes
//! topic-tagged messages to subscribers, and exposes "latest value plus
//! connection status" per topic for rendering layers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: State machines and data types
//!   - `connection`: Connection status and bookkeeping
//!   - `market`: Inbound messages and payloads
//!   - `subscription`: Topic → subscriber registry
//!   - `view`: Per-topic view state
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and codec interfaces
//!   - `services`: Connection manager, market stream, view adapter
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: tokio-tungstenite transport, JSON/MessagePack codec
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                  ┌───────────────────┐    ┌──────────────┐    ┌──────────────┐
//! Upstream WS ───► │ ConnectionManager │──► │ MarketStream │──► │ ViewState    │──► View 1
//!   (frames)       │ reconnect + ping  │    │ registry     │    │ Adapter      │──► View N
//!                  └───────────────────┘ ◄──│ join/leave   │    └──────────────┘
//!                                           └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, ConnectionStatus};
pub use domain::market::{InboundMessage, MarketPayload, Topic};
pub use domain::subscription::{
    DispatchOutcome, MessageCallback, RegistryStats, SubscriptionHandle, SubscriptionRegistry,
    TopicChange,
};
pub use domain::view::{ViewState, ViewStatus};

// Ports
pub use application::ports::{
    CodecError, ControlFrame, Frame, FrameCodec, LinkEvent, Transport, TransportError,
    TransportLink,
};

// Services
pub use application::services::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionManager, MarketStream,
    StatusUpdate, ViewStateAdapter, ViewStateHandle,
};

// Infrastructure config
pub use infrastructure::config::{
    AuthToken, BridgeConfig, ConfigError, ServerSettings, WebSocketSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// WebSocket adapters
pub use infrastructure::websocket::{JsonCodec, WebSocketTransport};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
