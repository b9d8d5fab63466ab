//! Lifecycle event bus
//!
//! Every subscription owns an unbounded queue. [`ObserverBus::publish`] only
//! enqueues, so a slow listener never holds up the publisher; the listener
//! drains its queue on its own task. Filters run on the receiving side, never
//! inside `publish`.
//!
//! ```text
//! Coordinator → ObserverBus.publish(event) → [queue per subscription] → listener
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{BackupError, ErrorKind};
use crate::operation::{OperationId, OperationKind, OperationOutcome};

/// Identifier of a bus subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle stage reported by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStage {
    Pending,
    Running,
    Progress {
        current: u32,
        total: u32,
        label: Option<String>,
    },
    Succeeded(OperationOutcome),
    Failed(ErrorKind),
    Cancelled,
}

impl EventStage {
    /// Final stage for its operation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStage::Succeeded(_) | EventStage::Failed(_) | EventStage::Cancelled
        )
    }
}

/// An operation lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Bus-wide publish sequence, assigned on publish in queue order
    pub seq: u64,
    /// Operation the event belongs to
    pub operation: OperationId,
    /// Kind of that operation
    pub kind: OperationKind,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub stage: EventStage,
}

impl OperationEvent {
    /// Create an unsequenced event
    pub fn new(operation: OperationId, kind: OperationKind, stage: EventStage) -> Self {
        Self {
            seq: 0,
            operation,
            kind,
            timestamp: Utc::now(),
            stage,
        }
    }

    /// Final event for its operation
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Predicate selecting the events a subscription receives
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(&OperationEvent) -> bool + Send + Sync>);

impl EventFilter {
    /// Custom predicate
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&OperationEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Every event
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Events of one operation kind
    pub fn kind(kind: OperationKind) -> Self {
        Self::new(move |event| event.kind == kind)
    }

    /// Events of one operation
    pub fn operation(id: OperationId) -> Self {
        Self::new(move |event| event.operation == id)
    }

    /// Terminal events only
    pub fn terminal() -> Self {
        Self::new(OperationEvent::is_terminal)
    }

    /// Whether `event` passes
    pub fn matches(&self, event: &OperationEvent) -> bool {
        (self.0)(event)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    receiver: mpsc::UnboundedReceiver<OperationEvent>,
}

impl Subscription {
    /// Subscription id, for [`ObserverBus::unsubscribe`]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next matching event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<OperationEvent> {
        while let Some(event) = self.receiver.recv().await {
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Next queued matching event without waiting
    pub fn try_recv(&mut self) -> Option<OperationEvent> {
        while let Ok(event) = self.receiver.try_recv() {
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Drain every queued event
    pub fn drain(&mut self) -> Vec<OperationEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Callback-style listener, dispatched on its own task by [`ObserverBus::attach`]
pub trait LifecycleObserver: Send + 'static {
    /// Operation accepted or started running
    fn on_started(&mut self, _event: &OperationEvent) {}

    /// Progress through a multi-package transfer
    fn on_progress(
        &mut self,
        _event: &OperationEvent,
        _current: u32,
        _total: u32,
        _label: Option<&str>,
    ) {
    }

    /// Operation reached a terminal state
    fn on_finished(&mut self, _event: &OperationEvent) {}
}

struct Subscriber {
    sender: mpsc::UnboundedSender<OperationEvent>,
    transient: bool,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

/// Publish/subscribe channel for operation lifecycle events
#[derive(Clone, Default)]
pub struct ObserverBus {
    inner: Arc<BusInner>,
}

impl ObserverBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that lives until unsubscribed
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.register(filter, false)
    }

    /// Register a listener removed by [`ObserverBus::unsubscribe_transient`]
    pub fn subscribe_transient(&self, filter: EventFilter) -> Subscription {
        self.register(filter, true)
    }

    /// Drive `observer` from a spawned task until unsubscribed.
    ///
    /// Fails with [`BackupError::NoRuntime`] outside a Tokio runtime.
    pub fn attach<O>(
        &self,
        filter: EventFilter,
        transient: bool,
        mut observer: O,
    ) -> Result<(SubscriptionId, JoinHandle<()>), BackupError>
    where
        O: LifecycleObserver,
    {
        let runtime = Handle::try_current().map_err(|_| BackupError::NoRuntime)?;
        let mut subscription = self.register(filter, transient);
        let id = subscription.id();
        let task = runtime.spawn(async move {
            while let Some(event) = subscription.recv().await {
                match &event.stage {
                    EventStage::Pending | EventStage::Running => observer.on_started(&event),
                    EventStage::Progress { current, total, label } => {
                        observer.on_progress(&event, *current, *total, label.as_deref())
                    }
                    _ => observer.on_finished(&event),
                }
            }
        });
        Ok((id, task))
    }

    /// Queue `event` for every live subscription.
    ///
    /// Never runs subscriber code. The sequence number is assigned under the
    /// registry lock, so every queue sees events in `seq` order even when
    /// several publishers share the bus. Returns the number of subscriptions
    /// it was queued for.
    pub fn publish(&self, mut event: OperationEvent) -> usize {
        let mut subscribers = self.inner.subscribers.write();
        event.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;

        subscribers.retain(|id, subscriber| {
            let open = subscriber.sender.send(event.clone()).is_ok();
            if !open {
                debug!(subscription = %id, "Pruned closed subscription");
            }
            open
        });
        subscribers.len()
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.write().remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "Unsubscribed");
        }
        removed
    }

    /// Remove every transient subscription. Returns how many were removed.
    pub fn unsubscribe_transient(&self) -> usize {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|_, s| !s.transient);
        before - subscribers.len()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Drop every subscription
    pub fn close(&self) {
        let mut subscribers = self.inner.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        debug!(count = count, "Closed observer bus");
    }

    fn register(&self, filter: EventFilter, transient: bool) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .write()
            .insert(id, Subscriber { sender, transient });
        debug!(subscription = %id, transient = transient, "Subscribed");
        Subscription {
            id,
            filter,
            receiver,
        }
    }
}

impl fmt::Debug for ObserverBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
