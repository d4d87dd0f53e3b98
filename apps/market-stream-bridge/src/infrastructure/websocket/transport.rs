//! WebSocket Transport
//!
//! [`Transport`] implementation over `tokio-tungstenite` with rustls.
//! Authenticates with an optional bearer token on the upgrade request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Frame, LinkEvent, Transport, TransportError, TransportLink};
use crate::infrastructure::config::AuthToken;

/// Default time allowed for the TCP + TLS + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    auth_token: Option<AuthToken>,
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WebSocketTransport {
    /// Create a transport, optionally authenticating with `auth_token`.
    #[must_use]
    pub const fn new(auth_token: Option<AuthToken>) -> Self {
        Self {
            auth_token,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        validate_endpoint(endpoint)?;

        let mut request = endpoint.into_client_request().map_err(classify)?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose())).map_err(
                |_| TransportError::AuthRejected("token is not a valid header value".to_string()),
            )?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        tracing::info!(url = %endpoint, "Connecting to market stream");

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    TransportError::Network(format!(
                        "handshake timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                })?
                .map_err(classify)?;

        Ok(Box::new(WebSocketLink { stream }))
    }
}

/// An established WebSocket.
struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.stream.send(message).await.map_err(classify)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(classify)
    }

    async fn recv(&mut self) -> Result<LinkEvent, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(LinkEvent::Frame(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(LinkEvent::Frame(Frame::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Pong(_))) => return Ok(LinkEvent::Pong),
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(classify)?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Server sent close frame");
                    return Ok(LinkEvent::Closed {
                        reason: frame.map(|f| f.reason.as_str().to_owned()),
                    });
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(classify(e)),
                None => return Ok(LinkEvent::Closed { reason: None }),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

/// Reject endpoints that can never succeed.
///
/// # Errors
///
/// Returns [`TransportError::MalformedEndpoint`] unless `endpoint` is a
/// `ws://` or `wss://` URL with a host.
pub fn validate_endpoint(endpoint: &str) -> Result<(), TransportError> {
    let rest = endpoint
        .strip_prefix("wss://")
        .or_else(|| endpoint.strip_prefix("ws://"))
        .ok_or_else(|| {
            TransportError::MalformedEndpoint(format!("{endpoint}: scheme must be ws or wss"))
        })?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(TransportError::MalformedEndpoint(format!(
            "{endpoint}: missing or invalid host"
        )));
    }
    Ok(())
}

fn classify(error: WsError) -> TransportError {
    match error {
        WsError::Url(e) => TransportError::MalformedEndpoint(e.to_string()),
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::AuthRejected(format!("HTTP {}", response.status()))
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Network(other.to_string()),
    }
}
