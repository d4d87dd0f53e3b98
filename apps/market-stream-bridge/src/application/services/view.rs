//! View State Adapter
//!
//! Binds topics to observable [`ViewState`] cells for rendering layers.
//! Each binding holds one registry subscription; connection status changes
//! fan out to every bound view.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::application::services::connection::{ListenerId, StatusUpdate};
use crate::application::services::stream::MarketStream;
use crate::domain::connection::ConnectionStatus;
use crate::domain::market::{InboundMessage, Topic};
use crate::domain::subscription::SubscriptionHandle;
use crate::domain::view::ViewState;
use crate::infrastructure::metrics;

/// Identifier of a bound view.
pub type ViewId = u64;

struct ViewBinding {
    topic: Topic,
    state: watch::Sender<ViewState>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    released: AtomicBool,
}

impl ViewBinding {
    fn apply_message(&self, message: &InboundMessage, status: ConnectionStatus) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        self.state
            .send_modify(|view| view.apply_message(message, status));
    }

    fn apply_status(&self, status: ConnectionStatus, error: Option<&str>) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        self.state.send_modify(|view| view.apply_status(status, error));
    }
}

#[derive(Debug, Clone, Default)]
struct StatusCell {
    status: ConnectionStatus,
    error: Option<String>,
}

struct AdapterInner {
    stream: MarketStream,
    views: RwLock<HashMap<ViewId, Arc<ViewBinding>>>,
    status: RwLock<StatusCell>,
    next_id: AtomicU64,
}

impl AdapterInner {
    fn read_status(&self) -> StatusCell {
        self.stream
            .connection_state()
            .map_or_else(StatusCell::default, |state| StatusCell {
                status: state.status,
                error: state.last_error,
            })
    }

    /// Re-read the connection status and push it to every view.
    fn refresh_status(&self) {
        let cell = self.read_status();
        *self.status.write() = cell.clone();

        let views: Vec<Arc<ViewBinding>> = self.views.read().values().cloned().collect();
        for view in views {
            view.apply_status(cell.status, cell.error.as_deref());
        }
    }
}

/// Exposes "latest value + connection status" per bound topic.
pub struct ViewStateAdapter {
    inner: Arc<AdapterInner>,
    observer: ListenerId,
}

impl fmt::Debug for ViewStateAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewStateAdapter")
            .field("views", &self.view_count())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ViewStateAdapter {
    /// Create an adapter over `stream`.
    #[must_use]
    pub fn new(stream: MarketStream) -> Self {
        let inner = Arc::new(AdapterInner {
            stream: stream.clone(),
            views: RwLock::new(HashMap::new()),
            status: RwLock::new(StatusCell::default()),
            next_id: AtomicU64::new(1),
        });
        *inner.status.write() = inner.read_status();

        let weak: Weak<AdapterInner> = Arc::downgrade(&inner);
        let observer = stream.on_status(Arc::new(move |_update: &StatusUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.refresh_status();
            }
        }));

        Self { inner, observer }
    }

    /// Bind a view to `topic`.
    ///
    /// The view starts `loading`; if the topic already has a cached message
    /// it is shown immediately with the current connection status.
    ///
    /// # Panics
    ///
    /// Panics if the connection has to be opened outside a tokio runtime.
    #[must_use]
    pub fn bind(&self, topic: impl Into<Topic>) -> ViewStateHandle {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut initial = ViewState::loading(topic.clone());
        if let Some(snapshot) = self.inner.stream.snapshot(&topic) {
            initial.apply_message(&snapshot, self.inner.status.read().status);
        }
        let (state, _) = watch::channel(initial);

        let binding = Arc::new(ViewBinding {
            topic: topic.clone(),
            state,
            subscription: Mutex::new(None),
            released: AtomicBool::new(false),
        });
        self.inner.views.write().insert(id, Arc::clone(&binding));

        let weak_binding = Arc::downgrade(&binding);
        let weak_inner = Arc::downgrade(&self.inner);
        let subscription = self.inner.stream.subscribe(
            topic.clone(),
            Arc::new(move |message: &InboundMessage| {
                let (Some(binding), Some(inner)) = (weak_binding.upgrade(), weak_inner.upgrade())
                else {
                    return;
                };
                let status = inner.status.read().status;
                binding.apply_message(message, status);
            }),
        );
        *binding.subscription.lock() = Some(subscription);

        // Status may have moved while subscribing
        let cell = self.inner.read_status();
        binding.apply_status(cell.status, cell.error.as_deref());

        let count = self.view_count();
        metrics::set_bound_views(count);
        tracing::debug!(view_id = id, topic = %topic, views = count, "View bound");

        ViewStateHandle { id, binding }
    }

    /// Release a bound view. Releasing twice is a no-op.
    pub fn release(&self, handle: &ViewStateHandle) {
        if handle.binding.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let removed = self.inner.views.write().remove(&handle.id);
        let subscription = handle.binding.subscription.lock().take();
        if let Some(subscription) = subscription {
            self.inner.stream.unsubscribe(&subscription);
        }

        let count = self.view_count();
        metrics::set_bound_views(count);
        tracing::debug!(
            view_id = handle.id,
            topic = %handle.binding.topic,
            views = count,
            tracked = removed.is_some(),
            "View released"
        );
    }

    /// Connection status as last observed.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.read().status
    }

    /// Number of bound views.
    #[must_use]
    pub fn view_count(&self) -> usize {
        self.inner.views.read().len()
    }

    /// Underlying stream.
    #[must_use]
    pub fn stream(&self) -> &MarketStream {
        &self.inner.stream
    }
}

impl Drop for ViewStateAdapter {
    fn drop(&mut self) {
        self.inner.stream.remove_status_observer(self.observer);

        let bindings: Vec<Arc<ViewBinding>> =
            self.inner.views.write().drain().map(|(_, b)| b).collect();
        for binding in bindings {
            binding.released.store(true, Ordering::Release);
            if let Some(subscription) = binding.subscription.lock().take() {
                self.inner.stream.unsubscribe(&subscription);
            }
        }
        metrics::set_bound_views(0);
    }
}

// =============================================================================
// View State Handle
// =============================================================================

/// A bound view: read the current state or await changes.
pub struct ViewStateHandle {
    id: ViewId,
    binding: Arc<ViewBinding>,
}

impl fmt::Debug for ViewStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewStateHandle")
            .field("id", &self.id)
            .field("topic", &self.binding.topic)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ViewStateHandle {
    /// View identifier.
    #[must_use]
    pub const fn id(&self) -> ViewId {
        self.id
    }

    /// Bound topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.binding.topic
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ViewState {
        self.binding.state.borrow().clone()
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.binding.state.subscribe()
    }

    /// Stream of states, starting with the current one.
    #[must_use]
    pub fn changes(&self) -> WatchStream<ViewState> {
        WatchStream::new(self.subscribe())
    }

    /// Check if the view was released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.binding.released.load(Ordering::Acquire)
    }
}
