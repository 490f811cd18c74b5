//! Session-scoped event bus
//!
//! Every listener owns an unbounded queue drained by its own task, so a slow
//! or failing listener never delays the others. Publishing is synchronous and
//! enqueues to all matching listeners in one pass, which keeps events about
//! the same resource in publish order for every listener.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use requestor_types::{RequestorEvent, ResourceRef};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Predicate selecting the events a listener wants
pub type EventFilter = Arc<dyn Fn(&RequestorEvent) -> bool + Send + Sync>;

type Handler = Arc<dyn Fn(RequestorEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle returned by [`EventBus::listen`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<RequestorEvent>,
}

struct BusInner {
    listeners: DashMap<ListenerId, Listener>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Publish/subscribe hub for [`RequestorEvent`]s
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Invoke `handler` for every future event matching `filter`.
    ///
    /// Handler errors are logged and panics are caught; neither reaches the
    /// publisher or other listeners. Must be called within a tokio runtime.
    pub fn listen<P, F, Fut>(&self, filter: P, handler: F) -> ListenerId
    where
        P: Fn(&RequestorEvent) -> bool + Send + Sync + 'static,
        F: Fn(RequestorEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        let (id, mut rx) = self.register(Arc::new(filter));

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let name = event.name();
                let call = handler.clone();
                let outcome = AssertUnwindSafe(async move { call(event).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(listener = id.0, event = name, error = %e, "Event listener failed"),
                    Err(_) => error!(listener = id.0, event = name, "Event listener panicked"),
                }
            }
            debug!(listener = id.0, "Event listener drained");
        });

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
        id
    }

    /// Listen for events about one resource only.
    pub fn resource_listen<F, Fut>(&self, resource: &ResourceRef, handler: F) -> ListenerId
    where
        F: Fn(RequestorEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let resource = resource.clone();
        self.listen(move |event| event.resource() == Some(&resource), handler)
    }

    /// Receive matching events through a queue instead of a callback.
    pub fn subscribe<P>(&self, filter: P) -> EventSubscription
    where
        P: Fn(&RequestorEvent) -> bool + Send + Sync + 'static,
    {
        let (id, rx) = self.register(Arc::new(filter));
        EventSubscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    pub fn unlisten(&self, id: ListenerId) {
        self.inner.listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every matching listener. A no-op once shut down.
    pub fn publish(&self, event: RequestorEvent) {
        if self.is_closed() {
            debug!(event = event.name(), "Bus closed, dropping event");
            return;
        }

        let mut dead = Vec::new();
        for entry in self.inner.listeners.iter() {
            let listener = entry.value();
            let matched = std::panic::catch_unwind(AssertUnwindSafe(|| (listener.filter)(&event)))
                .unwrap_or_else(|_| {
                    error!(listener = entry.key().0, "Event filter panicked");
                    false
                });
            if matched && listener.tx.send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }

        for id in dead {
            self.inner.listeners.remove(&id);
        }
    }

    /// Stop accepting events, let every listener drain its queue and wait
    /// for the listener tasks to finish.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listeners.clear();

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Event listener task ended abnormally");
            }
        }
        debug!("Event bus shut down");
    }

    fn register(&self, filter: EventFilter) -> (ListenerId, mpsc::UnboundedReceiver<RequestorEvent>) {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.inner.listeners.insert(id, Listener { filter, tx });
        }
        (id, rx)
    }
}

/// Queue of events delivered to one subscriber; unregisters on drop
pub struct EventSubscription {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<RequestorEvent>,
    bus: EventBus,
}

impl EventSubscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next matching event, or `None` once the bus is shut down.
    pub async fn recv(&mut self) -> Option<RequestorEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RequestorEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unlisten(self.id);
    }
}
