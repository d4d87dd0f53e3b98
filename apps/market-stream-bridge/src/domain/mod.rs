//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the core domain types for realtime market data
//! subscriptions. Nothing here performs I/O: the registry reports which
//! upstream changes are needed and the application layer applies them.

/// Connection lifecycle state machine.
pub mod connection;

/// Market data messages (ticks, book deltas, status events).
pub mod market;

/// Topic subscription registry.
pub mod subscription;

/// UI-facing view state.
pub mod view;
