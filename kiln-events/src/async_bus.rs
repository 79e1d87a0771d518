//! Async event bus backed by a bounded tokio channel.
//!
//! Events are published into the queue and drained by a single consumer
//! task, so delivery order matches publish order. Back-pressure surfaces to
//! the publisher as [`EventError::QueueFull`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{Event, EventType};
use crate::{EventError, EventResult};

/// Default bounded queue size; override via `KILN_EVENT_QUEUE_SIZE`.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Async callback invoked for each matching event.
pub type AsyncEventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

struct AsyncSubscription {
    name: String,
    handler: AsyncEventHandler,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventType, Vec<AsyncSubscription>>,
    wildcard: Vec<AsyncSubscription>,
    history: Vec<Event>,
}

const MAX_HISTORY: usize = 1000;

enum QueueItem {
    Event(Event),
    /// Sentinel: consumer drains and exits.
    Shutdown,
}

/// Async event bus. Create, [`start`](Self::start), publish, and eventually
/// [`stop`](Self::stop) to drain.
pub struct AsyncEventBus {
    capacity: usize,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    registry: Arc<Mutex<Registry>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncEventBus {
    /// Build a bus with an explicit queue size.
    pub fn with_queue_size(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
            registry: Arc::new(Mutex::new(Registry::default())),
            consumer: Mutex::new(None),
        }
    }

    /// Build a bus sized from `KILN_EVENT_QUEUE_SIZE` (default 10 000).
    pub fn from_env() -> Self {
        let capacity = std::env::var("KILN_EVENT_QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_QUEUE_SIZE);
        Self::with_queue_size(capacity)
    }

    /// Spawn the consumer task. Idempotent: a second call while running is
    /// a no-op.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock();
        if consumer.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let registry = self.registry.clone();
        *consumer = Some(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let event = match item {
                    QueueItem::Event(event) => event,
                    QueueItem::Shutdown => break,
                };
                let handlers = {
                    let mut reg = registry.lock();
                    reg.history.push(event.clone());
                    let overflow = reg.history.len().saturating_sub(MAX_HISTORY);
                    if overflow > 0 {
                        reg.history.drain(..overflow);
                    }
                    let mut out: Vec<AsyncEventHandler> = Vec::new();
                    if let Some(entries) = reg.handlers.get(&event.event_type) {
                        out.extend(entries.iter().map(|s| s.handler.clone()));
                    }
                    out.extend(reg.wildcard.iter().map(|s| s.handler.clone()));
                    out
                };
                for handler in handlers {
                    let fut = handler(event.clone());
                    if let Err(err) =
                        tokio::spawn(async move { fut.await }).await
                    {
                        tracing::error!(
                            event_type = %event.event_type,
                            error = %err,
                            "async event handler failed"
                        );
                    }
                }
            }
            tracing::debug!("async event bus consumer stopped");
        }));
        tracing::debug!("async event bus consumer started");
    }

    /// Signal the consumer to stop and wait for the queue to drain.
    pub async fn stop(&self) {
        let handle = { self.consumer.lock().take() };
        let Some(handle) = handle else {
            return;
        };
        if handle.is_finished() {
            return;
        }
        let _ = self.tx.send(QueueItem::Shutdown).await;
        let _ = handle.await;
    }

    /// `true` while the consumer task is alive.
    pub fn running(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of events currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Register an async handler for one event type. Duplicate names for
    /// the same type are a no-op.
    pub fn subscribe<F>(&self, event_type: EventType, name: &str, handler: F)
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock();
        let entries = reg.handlers.entry(event_type).or_default();
        if entries.iter().any(|s| s.name == name) {
            return;
        }
        entries.push(AsyncSubscription {
            name: name.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Register an async handler for every event.
    pub fn subscribe_all<F>(&self, name: &str, handler: F)
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock();
        if reg.wildcard.iter().any(|s| s.name == name) {
            return;
        }
        reg.wildcard.push(AsyncSubscription {
            name: name.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Remove a handler by name.
    pub fn unsubscribe(&self, event_type: Option<EventType>, name: &str) {
        let mut reg = self.registry.lock();
        match event_type {
            Some(ty) => {
                if let Some(entries) = reg.handlers.get_mut(&ty) {
                    entries.retain(|s| s.name != name);
                }
            }
            None => reg.wildcard.retain(|s| s.name != name),
        }
    }

    /// Enqueue an event for async dispatch. Fails fast with
    /// [`EventError::QueueFull`] when the bounded queue is at capacity.
    pub fn publish(&self, event: Event) -> EventResult<()> {
        self.tx
            .try_send(QueueItem::Event(event))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => EventError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => EventError::NotRunning,
            })
    }

    /// Enqueue multiple events in order. Stops at the first full-queue
    /// failure; earlier events remain enqueued.
    pub fn publish_batch(&self, events: Vec<Event>) -> EventResult<()> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }

    /// Recent dispatched events, newest first.
    pub fn recent_events(&self, event_type: Option<EventType>, limit: usize) -> Vec<Event> {
        let reg = self.registry.lock();
        let mut events: Vec<Event> = match event_type {
            Some(ty) => reg
                .history
                .iter()
                .filter(|e| e.event_type == ty)
                .cloned()
                .collect(),
            None => reg.history.clone(),
        };
        events.reverse();
        events.truncate(limit);
        events
    }
}
