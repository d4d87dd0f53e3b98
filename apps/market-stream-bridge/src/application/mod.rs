//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (transport, codec).
pub mod ports;

/// Application services for connections, subscriptions and view state.
pub mod services;
