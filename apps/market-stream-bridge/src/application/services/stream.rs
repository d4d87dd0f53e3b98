//! Market Stream
//!
//! Ties the subscription registry to a managed connection: the first
//! subscriber of a topic joins it upstream, the last one leaves it, and the
//! connection only stays open while at least one topic is subscribed.
//!
//! # Join bookkeeping
//!
//! Joined topics are tracked per connection session. When a new session
//! starts (first connect or reconnect) the set is cleared and each active
//! topic is joined exactly once.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::application::ports::{ControlFrame, Frame, FrameCodec};
use crate::application::services::connection::{
    ConnectionError, ConnectionHandle, ConnectionManager, ListenerId, StatusListener,
    StatusUpdate,
};
use crate::domain::connection::{ConnectionState, ConnectionStatus};
use crate::domain::market::{InboundMessage, Topic};
use crate::domain::subscription::{
    DispatchOutcome, MessageCallback, RegistryStats, SubscriptionHandle, SubscriptionRegistry,
    TopicChange,
};
use crate::infrastructure::metrics::{self, ControlKind, FrameKind};

struct ActiveConnection {
    handle: ConnectionHandle,
    message_listener: ListenerId,
    status_listener: ListenerId,
}

impl ActiveConnection {
    fn release(self, manager: &ConnectionManager) -> StatusUpdate {
        self.handle.remove_listener(self.message_listener);
        self.handle.remove_listener(self.status_listener);
        let mut update = self.handle.current_update();
        update.status = ConnectionStatus::Disconnected;
        manager.close(self.handle);
        update
    }
}

#[derive(Default)]
struct LinkState {
    connection: Option<ActiveConnection>,
    joined: HashSet<Topic>,
    joined_session: u64,
}

struct StreamInner {
    endpoint: String,
    manager: Arc<ConnectionManager>,
    codec: Arc<dyn FrameCodec>,
    registry: SubscriptionRegistry,
    link: Mutex<LinkState>,
    observers: RwLock<Vec<(ListenerId, StatusListener)>>,
    next_observer: AtomicU64,
}

/// Topic subscriptions multiplexed over one managed connection.
///
/// Cloning is cheap; clones share the same registry and connection.
#[derive(Clone)]
pub struct MarketStream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for MarketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketStream")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl MarketStream {
    /// Create a stream for `endpoint`. No connection is opened until the
    /// first subscription.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        manager: Arc<ConnectionManager>,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                endpoint: endpoint.into(),
                manager,
                codec,
                registry: SubscriptionRegistry::new(),
                link: Mutex::new(LinkState::default()),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Subscribe `callback` to `topic`.
    ///
    /// The first subscriber of a topic opens the connection if needed and
    /// joins the topic upstream, immediately when connected or on the next
    /// connect otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the connection has to be opened outside a tokio runtime.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        callback: MessageCallback,
    ) -> SubscriptionHandle {
        let (handle, change) = self.inner.registry.subscribe(topic, callback);

        if let TopicChange::Joined(topic) = change {
            tracing::info!(topic = %topic, endpoint = %self.inner.endpoint, "Topic subscribed");
            let opened = {
                let mut link = self.inner.link.lock();
                let opened = self.inner.ensure_connection(&mut link);
                self.inner.sync_joins(&mut link);
                opened
            };
            if let Some(update) = opened {
                self.inner.notify(&update);
            }
        }

        metrics::set_active_topics(self.inner.registry.stats().topic_count);
        handle
    }

    /// Remove a subscription. Unknown or already-removed handles are ignored.
    ///
    /// The last subscriber of a topic sends one leave frame; once no topic
    /// remains the connection is closed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let TopicChange::Left(topic) = self.inner.registry.unsubscribe(handle) else {
            return;
        };
        tracing::info!(topic = %topic, endpoint = %self.inner.endpoint, "Topic unsubscribed");

        self.inner.leave(topic);
        metrics::set_active_topics(self.inner.registry.stats().topic_count);
    }

    /// Route one decoded message to its topic's subscribers.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        self.inner.dispatch(message)
    }

    /// Re-open a failed connection and re-join all active topics.
    ///
    /// Returns `false` if the connection is not in `failed` state.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn reopen(&self) -> bool {
        let failed = {
            let mut link = self.inner.link.lock();
            match &link.connection {
                Some(active) if active.handle.status() == ConnectionStatus::Failed => {
                    link.joined.clear();
                    link.connection.take()
                }
                _ => return false,
            }
        };

        if let Some(active) = failed {
            active.release(&self.inner.manager);
        }

        tracing::info!(endpoint = %self.inner.endpoint, "Re-opening failed connection");

        let opened = {
            let mut link = self.inner.link.lock();
            let opened = self.inner.ensure_connection(&mut link);
            self.inner.sync_joins(&mut link);
            opened
        };
        if let Some(update) = opened {
            self.inner.notify(&update);
        }
        true
    }

    /// Current connection status (`disconnected` without subscriptions).
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner
            .link
            .lock()
            .connection
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |active| active.handle.status())
    }

    /// Copy of the connection bookkeeping, if a connection is open.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner
            .link
            .lock()
            .connection
            .as_ref()
            .map(|active| active.handle.state())
    }

    /// Register an observer for connection status changes.
    ///
    /// Observers run on the connection task and must not block.
    pub fn on_status(&self, observer: StatusListener) -> ListenerId {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.write().push((id, observer));
        id
    }

    /// Remove a status observer.
    pub fn remove_status_observer(&self, id: ListenerId) {
        self.inner.observers.write().retain(|(oid, _)| *oid != id);
    }

    /// Last message delivered on `topic`.
    #[must_use]
    pub fn snapshot(&self, topic: &str) -> Option<InboundMessage> {
        self.inner.registry.snapshot(topic)
    }

    /// Topics with at least one subscriber.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.inner.registry.active_topics()
    }

    /// Topics joined on the current session.
    #[must_use]
    pub fn joined_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.inner.link.lock().joined.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscription statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }
}

impl StreamInner {
    /// Upstream half of an unsubscribe, after the registry dropped `topic`.
    fn leave(&self, topic: Topic) {
        let closed = {
            let mut link = self.link.lock();

            // A concurrent subscribe may have revived the topic and skipped its join
            if !self.registry.contains(&topic) && link.joined.remove(&topic) {
                if let Some(active) = &link.connection {
                    self.send_control(&active.handle, ControlFrame::Leave(vec![topic]));
                }
            }

            if self.registry.is_empty() {
                link.joined.clear();
                link.connection.take()
            } else {
                None
            }
        };

        if let Some(active) = closed {
            let update = active.release(&self.manager);
            self.notify(&update);
        }
    }

    /// Open the connection if there is something to subscribe to.
    ///
    /// Returns the initial status for observers when a connection was opened.
    fn ensure_connection(self: &Arc<Self>, link: &mut LinkState) -> Option<StatusUpdate> {
        if link.connection.is_some() || self.registry.is_empty() {
            return None;
        }

        let handle = self.manager.open(&self.endpoint);

        let weak: Weak<Self> = Arc::downgrade(self);
        let message_listener = handle.on_message(Arc::new(move |frame: &Frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(frame);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let status_listener = handle.on_status(Arc::new(move |update: &StatusUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(update);
            }
        }));

        let update = handle.current_update();
        link.joined.clear();
        link.connection = Some(ActiveConnection {
            handle,
            message_listener,
            status_listener,
        });
        Some(update)
    }

    /// Join every active topic not yet joined on the current session.
    fn sync_joins(&self, link: &mut LinkState) {
        let Some(active) = &link.connection else {
            return;
        };
        let state = active.handle.state();
        if !state.status.is_connected() {
            return;
        }

        if link.joined_session != state.session {
            link.joined.clear();
            link.joined_session = state.session;
        }

        for topic in self.registry.active_topics() {
            if link.joined.contains(&topic) {
                continue;
            }
            if self.send_control(&active.handle, ControlFrame::Join(vec![topic.clone()])) {
                link.joined.insert(topic);
            }
        }
    }

    fn send_control(&self, handle: &ConnectionHandle, control: ControlFrame) -> bool {
        let kind = match &control {
            ControlFrame::Join(_) => ControlKind::Join,
            ControlFrame::Leave(_) => ControlKind::Leave,
        };

        let frame = match self.codec.encode(&control) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, ?control, "Failed to encode control frame");
                return false;
            }
        };

        match handle.send(frame) {
            Ok(()) => {
                metrics::record_control_frame(kind);
                tracing::debug!(?control, session = handle.session(), "Control frame queued");
                true
            }
            Err(ConnectionError::NotConnected(status)) => {
                tracing::debug!(?control, %status, "Control frame deferred until connected");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, ?control, "Control frame not sent");
                false
            }
        }
    }

    fn on_status(&self, update: &StatusUpdate) {
        {
            let mut link = self.link.lock();
            let current = link.connection.as_ref().map(|active| active.handle.id());
            if current != Some(update.connection_id) {
                return;
            }
            if update.status.is_connected() {
                self.sync_joins(&mut link);
            }
        }
        self.notify(update);
    }

    fn on_frame(&self, frame: &Frame) {
        let kind = match frame {
            Frame::Text(_) => FrameKind::Text,
            Frame::Binary(_) => FrameKind::Binary,
        };
        metrics::record_frame_received(kind);

        match self.codec.decode(frame) {
            Ok(messages) => {
                for message in &messages {
                    self.dispatch(message);
                }
            }
            Err(e) => {
                metrics::record_malformed_frame(kind);
                tracing::warn!(
                    error = %e,
                    frame_len = frame.len(),
                    endpoint = %self.endpoint,
                    "Dropping malformed frame"
                );
            }
        }
    }

    fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        let outcome = self.registry.dispatch(message);
        match outcome {
            DispatchOutcome::Delivered(count) => {
                metrics::record_messages_dispatched(u64::try_from(count).unwrap_or(u64::MAX));
            }
            DispatchOutcome::UnknownTopic => {
                metrics::record_unknown_topic();
                tracing::debug!(topic = %message.topic, "Dropping message for unknown topic");
            }
        }
        outcome
    }

    fn notify(&self, update: &StatusUpdate) {
        let observers: Vec<StatusListener> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(update);
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(active) = self.link.get_mut().connection.take() {
            active.release(&self.manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use crate::application::ports::{CodecError, Transport, TransportError, TransportLink};
    use crate::application::services::connection::ConnectionConfig;

    struct NeverConnects;

    #[async_trait]
    impl Transport for NeverConnects {
        async fn connect(&self, _endpoint: &str) -> Result<Box<dyn TransportLink>, TransportError> {
            std::future::pending().await
        }
    }

    struct NullCodec;

    impl FrameCodec for NullCodec {
        fn decode(&self, _frame: &Frame) -> Result<Vec<InboundMessage>, CodecError> {
            Ok(Vec::new())
        }

        fn encode(&self, _control: &ControlFrame) -> Result<Frame, CodecError> {
            Ok(Frame::Text(String::new()))
        }
    }

    fn stream() -> (MarketStream, Arc<ConnectionManager>) {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(NeverConnects),
            ConnectionConfig::default(),
        ));
        let stream = MarketStream::new("ws://feed.test", Arc::clone(&manager), Arc::new(NullCodec));
        (stream, manager)
    }

    #[tokio::test]
    async fn connection_follows_subscriptions() {
        let (stream, manager) = stream();
        assert!(!manager.is_open("ws://feed.test"));

        let a = stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        let b = stream.subscribe("MSFT.tick", Arc::new(|_: &InboundMessage| {}));
        assert!(manager.is_open("ws://feed.test"));
        assert_eq!(stream.status(), ConnectionStatus::Connecting);

        stream.unsubscribe(&a);
        assert!(manager.is_open("ws://feed.test"));

        stream.unsubscribe(&b);
        assert!(!manager.is_open("ws://feed.test"));
        assert_eq!(stream.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn observers_see_open_and_close() {
        let (stream, _manager) = stream();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        stream.on_status(Arc::new(move |update: &StatusUpdate| sink.lock().push(update.status)));

        let handle = stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        stream.unsubscribe(&handle);

        assert_eq!(
            *seen.lock(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn joins_wait_for_connection() {
        let (stream, _manager) = stream();
        stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(stream.joined_topics().is_empty());
        assert_eq!(stream.active_topics(), vec!["AAPL.tick"]);
    }

    #[tokio::test]
    async fn resubscribe_during_leave_keeps_topic_joined() {
        let (stream, _manager) = stream();
        let first = stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        let _other = stream.subscribe("MSFT.tick", Arc::new(|_: &InboundMessage| {}));
        stream.inner.link.lock().joined.insert("AAPL.tick".to_string());

        // Registry half of an unsubscribe, then a subscribe slips in
        assert!(matches!(
            stream.inner.registry.unsubscribe(&first),
            TopicChange::Left(_)
        ));
        let _second = stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        stream.inner.leave("AAPL.tick".to_string());

        assert_eq!(stream.joined_topics(), vec!["AAPL.tick"]);
        assert_eq!(stream.active_topics(), vec!["AAPL.tick", "MSFT.tick"]);
    }

    #[tokio::test]
    async fn leave_drops_topic_without_subscribers() {
        let (stream, _manager) = stream();
        let first = stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        let _other = stream.subscribe("MSFT.tick", Arc::new(|_: &InboundMessage| {}));
        stream.inner.link.lock().joined.insert("AAPL.tick".to_string());

        stream.unsubscribe(&first);

        assert!(stream.joined_topics().is_empty());
    }

    #[tokio::test]
    async fn reopen_requires_failed_connection() {
        let (stream, _manager) = stream();
        assert!(!stream.reopen());

        stream.subscribe("AAPL.tick", Arc::new(|_: &InboundMessage| {}));
        assert!(!stream.reopen());
    }

    #[tokio::test]
    async fn direct_dispatch_reaches_subscribers() {
        let (stream, _manager) = stream();
        let prices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&prices);
        stream.subscribe(
            "AAPL.tick",
            Arc::new(move |msg: &InboundMessage| sink.lock().push(msg.payload.price())),
        );

        let outcome = stream.dispatch(&InboundMessage::tick("AAPL.tick", Decimal::new(1502, 1)));
        assert_eq!(outcome, DispatchOutcome::Delivered(1));
        assert_eq!(
            stream.dispatch(&InboundMessage::tick("MSFT.tick", Decimal::ONE)),
            DispatchOutcome::UnknownTopic
        );

        assert_eq!(*prices.lock(), vec![Some(Decimal::new(1502, 1))]);
        assert!(stream.snapshot("AAPL.tick").is_some());
    }
}
