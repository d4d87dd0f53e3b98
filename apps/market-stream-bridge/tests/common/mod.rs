//! Shared fixtures for integration tests.
//!
//! `ScriptedTransport` stands in for the WebSocket: each connect consumes the
//! next scripted step, and the test pushes inbound frames or drops the live
//! link at will.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use market_stream_bridge::application::services::reconnect::ReconnectConfig;
use market_stream_bridge::{
    ConnectionConfig, ConnectionManager, Frame, JsonCodec, LinkEvent, MarketStream, Transport,
    TransportError, TransportLink,
};

pub const ENDPOINT: &str = "wss://feed.test/stream";

/// Outcome of one connect attempt.
#[derive(Debug, Clone)]
pub enum ConnectStep {
    Accept,
    Fail(TransportError),
}

type Inbound = mpsc::UnboundedSender<Result<LinkEvent, TransportError>>;

#[derive(Default)]
struct ScriptState {
    steps: VecDeque<ConnectStep>,
    live: Option<Inbound>,
    sent: Vec<Frame>,
    closes: usize,
}

/// In-memory transport driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Transport that accepts every connect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that plays `steps` first, then accepts.
    pub fn with_script(steps: impl IntoIterator<Item = ConnectStep>) -> Self {
        let transport = Self::default();
        transport.state.lock().steps.extend(steps);
        transport
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether a link is currently open.
    pub fn is_linked(&self) -> bool {
        self.state.lock().live.is_some()
    }

    /// Number of links closed by the bridge.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Deliver a text frame on the live link.
    pub fn push_text(&self, text: &str) {
        self.push(Ok(LinkEvent::Frame(Frame::Text(text.to_string()))));
    }

    /// Deliver a binary frame on the live link.
    pub fn push_binary(&self, bytes: Vec<u8>) {
        self.push(Ok(LinkEvent::Frame(Frame::Binary(bytes))));
    }

    /// Fail the live link with a transient network error.
    pub fn drop_link(&self) {
        self.push(Err(TransportError::Network("connection reset".to_string())));
        self.state.lock().live = None;
    }

    /// Queue further connect outcomes.
    pub fn script(&self, steps: impl IntoIterator<Item = ConnectStep>) {
        self.state.lock().steps.extend(steps);
    }

    /// Every frame the bridge sent, parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(Frame::as_text)
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Topics of every sent control frame with the given action.
    pub fn sent_topics(&self, action: &str) -> Vec<String> {
        self.sent_json()
            .into_iter()
            .filter(|v| v["action"] == action)
            .flat_map(|v| {
                v["topics"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|t| t.as_str().map(ToString::to_string))
            })
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    fn push(&self, event: Result<LinkEvent, TransportError>) {
        let state = self.state.lock();
        let live = state.live.as_ref().expect("no live link");
        live.send(event).expect("link task gone");
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let step = self
            .state
            .lock()
            .steps
            .pop_front()
            .unwrap_or(ConnectStep::Accept);

        match step {
            ConnectStep::Fail(error) => Err(error),
            ConnectStep::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.state.lock().live = Some(tx);
                Ok(Box::new(ScriptedLink {
                    state: Arc::clone(&self.state),
                    inbound: rx,
                }))
            }
        }
    }
}

struct ScriptedLink {
    state: Arc<Mutex<ScriptState>>,
    inbound: mpsc::UnboundedReceiver<Result<LinkEvent, TransportError>>,
}

#[async_trait]
impl TransportLink for ScriptedLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.state.lock().sent.push(frame);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<LinkEvent, TransportError> {
        match self.inbound.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closes += 1;
        state.live = None;
        Ok(())
    }
}

/// Fast, jitter-free reconnect tuning.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            ..ReconnectConfig::default()
        }
        .without_jitter(),
        heartbeat: None,
    }
}

/// Stream over `transport` with the JSON codec.
pub fn stream_over(transport: &ScriptedTransport, config: ConnectionConfig) -> MarketStream {
    let manager = Arc::new(ConnectionManager::new(Arc::new(transport.clone()), config));
    MarketStream::new(ENDPOINT, manager, Arc::new(JsonCodec::new()))
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
