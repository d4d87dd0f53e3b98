//! Port Interfaces
//!
//! Contracts between the application services and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`] / [`TransportLink`]: a realtime frame transport (WebSocket)
//! - [`FrameCodec`]: maps raw frames to domain messages and control requests
//!   to raw frames

use async_trait::async_trait;

use crate::domain::market::{InboundMessage, Topic};

// =============================================================================
// Frames
// =============================================================================

/// One message unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Check if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text payload, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Event read from an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A data frame.
    Frame(Frame),
    /// Reply to a ping.
    Pong,
    /// The remote side closed the link.
    Closed {
        /// Close reason, if the peer sent one.
        reason: Option<String>,
    },
}

// =============================================================================
// Transport
// =============================================================================

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The endpoint cannot be parsed or uses an unsupported scheme.
    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(String),

    /// The endpoint refused our credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Network error; worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The link is closed.
    #[error("link closed")]
    Closed,
}

impl TransportError {
    /// Check if retrying cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedEndpoint(_) | Self::AuthRejected(_))
    }
}

/// Factory for links to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new link to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// An established bidirectional link.
#[async_trait]
pub trait TransportLink: Send {
    /// Send a data frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a liveness ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Wait for the next inbound event.
    async fn recv(&mut self) -> Result<LinkEvent, TransportError>;

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// =============================================================================
// Codec
// =============================================================================

/// Control request sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Start streaming these topics.
    Join(Vec<Topic>),
    /// Stop streaming these topics.
    Leave(Vec<Topic>),
}

/// Frame decoding or encoding failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Text frame is not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame is not valid MessagePack.
    #[error("invalid msgpack: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),

    /// Frame parsed but does not have the expected structure.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Wire format of the upstream endpoint.
pub trait FrameCodec: Send + Sync {
    /// Decode one frame into zero or more messages.
    ///
    /// # Errors
    ///
    /// Returns an error when any part of the frame is malformed; the
    /// whole frame is then dropped.
    fn decode(&self, frame: &Frame) -> Result<Vec<InboundMessage>, CodecError>;

    /// Encode a control request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self, control: &ControlFrame) -> Result<Frame, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(TransportError::MalformedEndpoint("ftp://x".into()).is_fatal());
        assert!(TransportError::AuthRejected("401".into()).is_fatal());
        assert!(!TransportError::Network("reset".into()).is_fatal());
        assert!(!TransportError::Closed.is_fatal());
    }

    #[test]
    fn frame_len() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert!(Frame::Binary(Vec::new()).is_empty());
        assert_eq!(Frame::Text("x".into()).as_text(), Some("x"));
    }
}
