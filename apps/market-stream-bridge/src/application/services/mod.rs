//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ConnectionManager`: one managed realtime connection per endpoint
//! - `MarketStream`: topic subscriptions over a managed connection
//! - `ViewStateAdapter`: observable view state per bound topic

/// Managed connections with reconnect and heartbeat.
pub mod connection;

/// Liveness pings for established links.
pub mod heartbeat;

/// Exponential backoff for reconnection.
pub mod reconnect;

/// Registry-to-connection orchestration.
pub mod stream;

/// Observable view state bindings.
pub mod view;

pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionManager, StatusUpdate,
};
pub use stream::MarketStream;
pub use view::{ViewStateAdapter, ViewStateHandle};
