//! Configuration Module
//!
//! Configuration loading for the bridge service.

mod settings;

pub use settings::{AuthToken, BridgeConfig, ConfigError, ServerSettings, WebSocketSettings};
