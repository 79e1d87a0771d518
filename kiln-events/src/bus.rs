//! Synchronous, thread-safe publish/subscribe bus.
//!
//! Handlers run in the publishing thread, in registration order. A panicking
//! handler is logged and does not prevent the remaining handlers from
//! running. History is a bounded ring trimmed on insertion.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{Event, EventType};

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
/// Predicate evaluated before a handler is called.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

const MAX_HISTORY: usize = 1000;

struct Subscription {
    name: String,
    handler: EventHandler,
    filter: Option<EventFilter>,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<EventType, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
    /// `(dotted prefix, subscription)` pairs, matched against the event type string.
    prefixed: Vec<(String, Subscription)>,
    history: Vec<Event>,
}

/// Thread-safe publish/subscribe event bus.
///
/// Subscriptions are keyed by a caller-chosen name; re-subscribing the same
/// name for the same event type is a no-op, which makes wiring idempotent.
pub struct EventBus {
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
        }
    }

    /// Register a handler for a specific event type.
    pub fn subscribe<F>(&self, event_type: EventType, name: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_filtered(event_type, name, handler, None);
    }

    /// Register a handler with an optional filter predicate.
    pub fn subscribe_filtered<F>(
        &self,
        event_type: EventType,
        name: &str,
        handler: F,
        filter: Option<EventFilter>,
    ) where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let entries = state.handlers.entry(event_type).or_default();
        if entries.iter().any(|s| s.name == name) {
            tracing::debug!(name, %event_type, "duplicate subscription, skipping");
            return;
        }
        entries.push(Subscription {
            name: name.to_string(),
            handler: Arc::new(handler),
            filter,
        });
    }

    /// Register a handler for ALL events.
    pub fn subscribe_all<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.wildcard.iter().any(|s| s.name == name) {
            tracing::debug!(name, "duplicate wildcard subscription, skipping");
            return;
        }
        state.wildcard.push(Subscription {
            name: name.to_string(),
            handler: Arc::new(handler),
            filter: None,
        });
    }

    /// Register a handler for every event whose dotted type starts with
    /// `prefix`. A bare word like `"print"` is treated as `"print."`.
    pub fn subscribe_prefix<F>(&self, prefix: &str, name: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let prefix = normalize_prefix(prefix);
        let mut state = self.state.lock();
        if state
            .prefixed
            .iter()
            .any(|(p, s)| *p == prefix && s.name == name)
        {
            tracing::debug!(name, prefix, "duplicate prefix subscription, skipping");
            return;
        }
        state.prefixed.push((
            prefix,
            Subscription {
                name: name.to_string(),
                handler: Arc::new(handler),
                filter: None,
            },
        ));
    }

    /// Remove a previously registered handler. Silently does nothing if the
    /// name is not found.
    pub fn unsubscribe(&self, event_type: Option<EventType>, name: &str) {
        let mut state = self.state.lock();
        match event_type {
            Some(ty) => {
                if let Some(entries) = state.handlers.get_mut(&ty) {
                    entries.retain(|s| s.name != name);
                }
            }
            None => {
                state.wildcard.retain(|s| s.name != name);
                state.prefixed.retain(|(_, s)| s.name != name);
            }
        }
    }

    fn matching_handlers(state: &BusState, event: &Event) -> Vec<(EventHandler, Option<EventFilter>)> {
        let type_str = event.event_type.as_str();
        let mut out = Vec::new();
        if let Some(entries) = state.handlers.get(&event.event_type) {
            for sub in entries {
                out.push((sub.handler.clone(), sub.filter.clone()));
            }
        }
        for (prefix, sub) in &state.prefixed {
            if type_str.starts_with(prefix.as_str()) {
                out.push((sub.handler.clone(), sub.filter.clone()));
            }
        }
        for sub in &state.wildcard {
            out.push((sub.handler.clone(), sub.filter.clone()));
        }
        out
    }

    fn dispatch(event: &Event, handlers: &[(EventHandler, Option<EventFilter>)]) {
        for (handler, filter) in handlers {
            if let Some(filter) = filter {
                if !filter(event) {
                    continue;
                }
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                tracing::error!(event_type = %event.event_type, "event handler panicked");
            }
        }
    }

    fn record(state: &mut BusState, event: &Event) {
        state.history.push(event.clone());
        let overflow = state.history.len().saturating_sub(MAX_HISTORY);
        if overflow > 0 {
            state.history.drain(..overflow);
        }
    }

    /// Dispatch an event to all matching handlers.
    ///
    /// The event is recorded to history and the handler list snapshotted
    /// under the lock; handlers run outside it.
    pub fn publish(&self, event: Event) {
        let handlers = {
            let mut state = self.state.lock();
            Self::record(&mut state, &event);
            Self::matching_handlers(&state, &event)
        };
        Self::dispatch(&event, &handlers);
    }

    /// Publish multiple events; all are recorded under a single lock
    /// acquisition before any handler runs.
    pub fn publish_batch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let targets = {
            let mut state = self.state.lock();
            let mut targets = Vec::with_capacity(events.len());
            for event in events {
                Self::record(&mut state, &event);
                let handlers = Self::matching_handlers(&state, &event);
                targets.push((event, handlers));
            }
            targets
        };
        for (event, handlers) in &targets {
            Self::dispatch(event, handlers);
        }
    }

    /// Schedule an event for async delivery when a tokio runtime is active;
    /// falls back to a synchronous publish otherwise. History is recorded
    /// synchronously either way so `recent_events` sees the event at once.
    pub fn dispatch_async(&self, event: Event) {
        let handlers = {
            let mut state = self.state.lock();
            Self::record(&mut state, &event);
            Self::matching_handlers(&state, &event)
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    Self::dispatch(&event, &handlers);
                });
            }
            Err(_) => Self::dispatch(&event, &handlers),
        }
    }

    /// Recent events, newest first, optionally filtered by exact type.
    pub fn recent_events(&self, event_type: Option<EventType>, limit: usize) -> Vec<Event> {
        let state = self.state.lock();
        let mut events: Vec<Event> = match event_type {
            Some(ty) => state
                .history
                .iter()
                .filter(|e| e.event_type == ty)
                .cloned()
                .collect(),
            None => state.history.clone(),
        };
        events.reverse();
        events.truncate(limit);
        events
    }

    /// Recent events whose dotted type starts with `prefix`, newest first.
    pub fn recent_events_by_prefix(&self, prefix: &str, limit: usize) -> Vec<Event> {
        let prefix = normalize_prefix(prefix);
        let state = self.state.lock();
        let mut events: Vec<Event> = state
            .history
            .iter()
            .filter(|e| e.event_type.as_str().starts_with(prefix.as_str()))
            .cloned()
            .collect();
        events.reverse();
        events.truncate(limit);
        events
    }

    /// Drop all recorded history.
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.contains('.') {
        prefix.to_string()
    } else {
        format!("{prefix}.")
    }
}
