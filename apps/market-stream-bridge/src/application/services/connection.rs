//! Connection Manager
//!
//! Owns one logical realtime connection per endpoint. Each connection runs
//! in its own task: connect, pump frames, detect dead links through the
//! heartbeat, and reconnect with backoff until closed or failed.
//!
//! # Lifecycle
//!
//! - [`ConnectionManager::open`] is idempotent per endpoint. Every call
//!   returns a new [`ConnectionHandle`] onto the same connection and bumps
//!   its holder count.
//! - Dropping (or [`ConnectionManager::close`]-ing) the last handle cancels
//!   the task and moves the connection to `disconnected`.
//! - Malformed endpoints, rejected credentials and exhausted retries move the
//!   connection to `failed`; the task stops and the next `open` starts over.
//!
//! Listener callbacks run on the connection task and must not block.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{Frame, LinkEvent, Transport, TransportError, TransportLink};
use crate::application::services::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
use crate::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::domain::connection::{ConnectionState, ConnectionStatus};
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Identifier returned when registering a listener.
pub type ListenerId = u64;

/// Callback for inbound data frames.
pub type FrameListener = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Callback for status transitions.
pub type StatusListener = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Tuning for connections opened by a manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Backoff between reconnection attempts.
    pub reconnect: ReconnectConfig,
    /// Liveness checks; `None` disables pings.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl ConnectionConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_websocket_settings(settings),
            heartbeat: Some(HeartbeatConfig::from_websocket_settings(settings)),
        }
    }
}

/// A status transition, delivered to status listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Logical connection the update belongs to.
    pub connection_id: Uuid,
    /// New status.
    pub status: ConnectionStatus,
    /// Session counter at the time of the update.
    pub session: u64,
    /// Error behind a `reconnecting` or `failed` status.
    pub error: Option<String>,
    /// Reconnection attempt number (0 outside backoff).
    pub attempt: u32,
    /// Backoff delay before the next attempt.
    pub backoff: Option<Duration>,
}

impl StatusUpdate {
    fn from_state(connection_id: Uuid, state: &ConnectionState) -> Self {
        Self {
            connection_id,
            status: state.status,
            session: state.session,
            error: state.last_error.clone(),
            attempt: state.retry_count,
            backoff: state.backoff_delay,
        }
    }
}

/// Connection-level errors surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The link is not established; nothing was sent.
    #[error("not connected (status: {0})")]
    NotConnected(ConnectionStatus),

    /// The connection failed and needs to be re-opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection task is gone.
    #[error("connection handle closed")]
    HandleClosed,
}

struct Outbound {
    session: u64,
    frame: Frame,
}

// =============================================================================
// Shared Connection State
// =============================================================================

struct ConnectionShared {
    id: Uuid,
    endpoint: String,
    state: RwLock<ConnectionState>,
    holders: AtomicUsize,
    cancel: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    frame_listeners: RwLock<Vec<(ListenerId, FrameListener)>>,
    status_listeners: RwLock<Vec<(ListenerId, StatusListener)>>,
    next_listener: AtomicU64,
}

impl ConnectionShared {
    fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    /// Apply `change` and notify status listeners if it took effect.
    ///
    /// Ignored once the connection is cancelled; only `shutdown` may move a
    /// cancelled connection.
    fn update(&self, change: impl FnOnce(&mut ConnectionState) -> bool) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.apply(change)
    }

    fn apply(&self, change: impl FnOnce(&mut ConnectionState) -> bool) -> bool {
        let update = {
            let mut state = self.state.write();
            if !change(&mut state) {
                return false;
            }
            StatusUpdate::from_state(self.id, &state)
        };

        metrics::set_connection_status(update.status);
        tracing::debug!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            status = %update.status,
            session = update.session,
            "Connection status changed"
        );

        let listeners: Vec<StatusListener> = self
            .status_listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&update);
        }
        true
    }

    fn deliver(&self, frame: &Frame) {
        let listeners: Vec<FrameListener> = self
            .frame_listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(frame);
        }
    }

    fn fail(&self, error: &str) {
        tracing::error!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            error = %error,
            "Connection failed"
        );
        self.update(|state| state.mark_failed(error));
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.apply(|state| state.transition(ConnectionStatus::Disconnected));
    }
}

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<ConnectionShared>>>>;

// =============================================================================
// Connection Manager
// =============================================================================

/// Opens and tracks logical connections, one per endpoint.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    connections: ConnectionMap,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that dials through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open (or join) the connection for `endpoint`.
    ///
    /// A connection in `failed` state is replaced by a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime when a new connection task
    /// has to be spawned.
    #[must_use]
    pub fn open(&self, endpoint: &str) -> ConnectionHandle {
        let mut connections = self.connections.lock();

        let shared = match connections.get(endpoint) {
            Some(existing) if existing.status() != ConnectionStatus::Failed => {
                Arc::clone(existing)
            }
            _ => {
                let shared = self.spawn(endpoint);
                connections.insert(endpoint.to_string(), Arc::clone(&shared));
                shared
            }
        };
        shared.holders.fetch_add(1, Ordering::SeqCst);

        ConnectionHandle {
            shared,
            connections: Arc::clone(&self.connections),
        }
    }

    /// Release `handle`. The last release closes the connection.
    pub fn close(&self, handle: ConnectionHandle) {
        drop(handle);
    }

    /// Check if a live connection exists for `endpoint`.
    #[must_use]
    pub fn is_open(&self, endpoint: &str) -> bool {
        self.connections.lock().contains_key(endpoint)
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn spawn(&self, endpoint: &str) -> Arc<ConnectionShared> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut state = ConnectionState::new(endpoint);
        state.transition(ConnectionStatus::Connecting);
        metrics::set_connection_status(state.status);

        let shared = Arc::new(ConnectionShared {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            state: RwLock::new(state),
            holders: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            outbound_tx,
            frame_listeners: RwLock::new(Vec::new()),
            status_listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        });

        tracing::info!(
            connection_id = %shared.id,
            endpoint = %endpoint,
            "Opening connection"
        );

        tokio::spawn(run_connection(
            Arc::clone(&shared),
            Arc::clone(&self.transport),
            self.config.clone(),
            outbound_rx,
        ));

        shared
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

/// A holder's reference to a logical connection.
///
/// Dropping the handle releases it.
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    connections: ConnectionMap,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionHandle {
    /// Logical connection identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Current session counter.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.shared.state.read().session
    }

    /// Copy of the connection bookkeeping.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    /// Current status as an update record.
    #[must_use]
    pub fn current_update(&self) -> StatusUpdate {
        StatusUpdate::from_state(self.shared.id, &self.shared.state.read())
    }

    /// Queue `frame` on the current link.
    ///
    /// Frames are bound to the current session; if the link drops before
    /// they go out they are discarded rather than replayed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless the status is
    /// `connected`, and [`ConnectionError::HandleClosed`] if the connection
    /// task has stopped.
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let session = {
            let state = self.shared.state.read();
            match state.status {
                ConnectionStatus::Connected => state.session,
                ConnectionStatus::Failed => {
                    return Err(ConnectionError::ConnectionFailed(
                        state.last_error.clone().unwrap_or_default(),
                    ));
                }
                status => return Err(ConnectionError::NotConnected(status)),
            }
        };

        self.shared
            .outbound_tx
            .send(Outbound { session, frame })
            .map_err(|_| ConnectionError::HandleClosed)
    }

    /// Register a listener for inbound data frames.
    pub fn on_message(&self, listener: FrameListener) -> ListenerId {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.frame_listeners.write().push((id, listener));
        id
    }

    /// Register a listener for status transitions.
    pub fn on_status(&self, listener: StatusListener) -> ListenerId {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.status_listeners.write().push((id, listener));
        id
    }

    /// Remove a frame or status listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.frame_listeners.write().retain(|(lid, _)| *lid != id);
        self.shared.status_listeners.write().retain(|(lid, _)| *lid != id);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let last = {
            let mut connections = self.connections.lock();
            let last = self.shared.holders.fetch_sub(1, Ordering::SeqCst) == 1;
            if last
                && connections
                    .get(&self.shared.endpoint)
                    .is_some_and(|entry| Arc::ptr_eq(entry, &self.shared))
            {
                connections.remove(&self.shared.endpoint);
            }
            last
        };

        if last {
            tracing::info!(
                connection_id = %self.shared.id,
                endpoint = %self.shared.endpoint,
                "Closing connection"
            );
            self.shared.shutdown();
        }
    }
}

// =============================================================================
// Connection Task
// =============================================================================

async fn run_connection(
    shared: Arc<ConnectionShared>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut policy = ReconnectPolicy::new(config.reconnect.clone());

    loop {
        let connected = tokio::select! {
            () = shared.cancel.cancelled() => break,
            result = transport.connect(&shared.endpoint) => result,
        };

        let error = match connected {
            Ok(mut link) => {
                policy.reset();

                // Anything still queued belongs to a previous session
                while outbound_rx.try_recv().is_ok() {}

                if !shared.update(ConnectionState::mark_connected) {
                    let _ = link.close().await;
                    break;
                }
                let session = shared.state.read().session;
                tracing::info!(
                    connection_id = %shared.id,
                    endpoint = %shared.endpoint,
                    session,
                    "Connected"
                );

                match pump(
                    &shared,
                    link.as_mut(),
                    &mut outbound_rx,
                    session,
                    config.heartbeat.as_ref(),
                )
                .await
                {
                    Ok(()) => break,
                    Err(error) => error,
                }
            }
            Err(error) => error,
        };

        if shared.cancel.is_cancelled() {
            break;
        }

        if error.is_fatal() {
            shared.fail(&error.to_string());
            break;
        }

        let Some(delay) = policy.next_delay() else {
            shared.fail(&format!(
                "gave up after {} reconnection attempts: {error}",
                policy.attempt_count()
            ));
            break;
        };
        let attempt = policy.attempt_count();

        tracing::warn!(
            connection_id = %shared.id,
            endpoint = %shared.endpoint,
            error = %error,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Link lost, reconnecting"
        );
        metrics::record_reconnect();

        let message = error.to_string();
        shared.update(|state| {
            let moved = state.begin_backoff(attempt, delay);
            if moved {
                state.last_error = Some(message);
            }
            moved
        });

        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(connection_id = %shared.id, "Connection task stopped");
}

/// Move frames until the link fails or the connection is cancelled.
///
/// Returns `Ok(())` only on cancellation.
async fn pump(
    shared: &ConnectionShared,
    link: &mut dyn TransportLink,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    session: u64,
    heartbeat: Option<&HeartbeatConfig>,
) -> Result<(), TransportError> {
    let heartbeat_cancel = shared.cancel.child_token();
    let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
    let liveness = Arc::new(HeartbeatState::new());
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);

    if let Some(config) = heartbeat {
        tokio::spawn(
            HeartbeatManager::new(
                config.clone(),
                Arc::clone(&liveness),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );
    } else {
        drop(heartbeat_tx);
    }

    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => {
                // Flush what the last holder queued (e.g. leave frames)
                while let Ok(outbound) = outbound_rx.try_recv() {
                    if outbound.session == session {
                        let _ = link.send(outbound.frame).await;
                    }
                }
                let _ = link.close().await;
                return Ok(());
            }

            Some(event) = heartbeat_rx.recv() => match event {
                HeartbeatEvent::SendPing => {
                    link.ping().await?;
                    liveness.mark_ping_sent();
                }
                HeartbeatEvent::Timeout => {
                    return Err(TransportError::Network("heartbeat timeout".to_string()));
                }
            },

            Some(outbound) = outbound_rx.recv() => {
                if outbound.session == session {
                    link.send(outbound.frame).await?;
                } else {
                    tracing::debug!(
                        connection_id = %shared.id,
                        frame_session = outbound.session,
                        session,
                        "Dropping frame queued for a previous session"
                    );
                }
            }

            event = link.recv() => match event? {
                LinkEvent::Frame(frame) => {
                    liveness.record_activity();
                    shared.deliver(&frame);
                }
                LinkEvent::Pong => liveness.record_activity(),
                LinkEvent::Closed { reason } => {
                    return Err(TransportError::Network(format!(
                        "closed by peer: {}",
                        reason.as_deref().unwrap_or("no reason")
                    )));
                }
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use async_trait::async_trait;

    /// Transport whose connects fail with a fixed error.
    struct FailingTransport {
        error: TransportError,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn connect(&self, _endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    /// Link that replays queued events, then stays silent.
    struct QueueLink {
        events: VecDeque<LinkEvent>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl TransportLink for QueueLink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<LinkEvent, TransportError> {
            match self.events.pop_front() {
                Some(event) => Ok(event),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct QueueTransport {
        events: Vec<LinkEvent>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl Transport for QueueTransport {
        async fn connect(&self, _endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError> {
            Ok(Box::new(QueueLink {
                events: self.events.iter().cloned().collect(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 0,
            },
            heartbeat: None,
        }
    }

    async fn wait_for(handle: &ConnectionHandle, status: ConnectionStatus) {
        for _ in 0..200 {
            if handle.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {status}, still {}", handle.status());
    }

    #[tokio::test]
    async fn open_is_idempotent_per_endpoint() {
        let transport = Arc::new(QueueTransport {
            events: vec![],
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        let manager = ConnectionManager::new(transport, fast_config());

        let a = manager.open("ws://feed.test");
        let b = manager.open("ws://feed.test");
        assert_eq!(a.id(), b.id());
        assert_eq!(manager.connection_count(), 1);

        manager.close(a);
        assert!(manager.is_open("ws://feed.test"));

        wait_for(&b, ConnectionStatus::Connected).await;
        let shared = Arc::clone(&b.shared);
        manager.close(b);
        assert!(!manager.is_open("ws://feed.test"));
        assert_eq!(shared.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn send_fails_fast_while_not_connected() {
        let transport = Arc::new(FailingTransport {
            error: TransportError::Network("refused".into()),
            attempts: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(transport, fast_config());

        let handle = manager.open("ws://feed.test");
        let result = handle.send(Frame::Text("{}".into()));

        assert!(matches!(result, Err(ConnectionError::NotConnected(_))));
    }

    #[tokio::test]
    async fn auth_rejection_is_terminal() {
        let transport = Arc::new(FailingTransport {
            error: TransportError::AuthRejected("401".into()),
            attempts: AtomicUsize::new(0),
        });
        let manager =
            ConnectionManager::new(Arc::clone(&transport) as Arc<dyn Transport>, fast_config());

        let handle = manager.open("ws://feed.test");
        wait_for(&handle, ConnectionStatus::Failed).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(handle.state().last_error.unwrap().contains("401"));
        assert!(matches!(
            handle.send(Frame::Text("{}".into())),
            Err(ConnectionError::ConnectionFailed(_))
        ));

        // Re-open starts a new logical connection
        let reopened = manager.open("ws://feed.test");
        assert_ne!(reopened.id(), handle.id());
    }

    #[tokio::test]
    async fn transient_errors_retry_until_max_attempts() {
        let transport = Arc::new(FailingTransport {
            error: TransportError::Network("refused".into()),
            attempts: AtomicUsize::new(0),
        });
        let mut config = fast_config();
        config.reconnect.max_attempts = 2;
        let manager = ConnectionManager::new(Arc::clone(&transport) as Arc<dyn Transport>, config);

        let handle = manager.open("ws://feed.test");
        wait_for(&handle, ConnectionStatus::Failed).await;

        // Initial attempt plus two retries
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sent_frames_reach_the_link() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(QueueTransport {
            events: vec![],
            sent: Arc::clone(&sent),
        });
        let manager = ConnectionManager::new(transport, fast_config());

        let handle = manager.open("ws://feed.test");
        wait_for(&handle, ConnectionStatus::Connected).await;
        handle.send(Frame::Text("join".into())).unwrap();

        for _ in 0..100 {
            if !sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*sent.lock(), vec![Frame::Text("join".into())]);
    }
}
