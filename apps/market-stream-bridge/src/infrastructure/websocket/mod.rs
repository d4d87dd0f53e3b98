//! WebSocket Adapters
//!
//! Concrete transport and codec for the upstream market stream:
//!
//! - **Transport**: `tokio-tungstenite` over rustls, bearer-token auth
//! - **Codec**: JSON text frames, `MessagePack` binary frames

pub mod codec;
pub mod messages;
pub mod transport;

pub use codec::JsonCodec;
pub use messages::{ControlAction, ControlRequest, WireType};
pub use transport::{DEFAULT_CONNECT_TIMEOUT, WebSocketTransport, validate_endpoint};
