//! Event system — publish/subscribe for printer and job lifecycle events.
//!
//! Components register callbacks for events they care about. When something
//! happens (print started, print failed, payment completed, etc.) the bus
//! dispatches to every registered listener.
//!
//! Two variants are provided: a synchronous [`EventBus`] for thread-based
//! callers where ordering matters, and an [`AsyncEventBus`] backed by a
//! bounded tokio channel for non-blocking dispatch to slow sinks.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod async_bus;
pub mod bus;
pub mod event;

pub use async_bus::{AsyncEventBus, DEFAULT_QUEUE_SIZE};
pub use bus::EventBus;
pub use event::{Event, EventType};

use thiserror::Error;

/// Result type for event bus operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors surfaced by the event buses.
#[derive(Debug, Error)]
pub enum EventError {
    /// The async bus queue is at capacity.
    #[error("event queue is full ({capacity} events)")]
    QueueFull { capacity: usize },

    /// The async bus consumer is not running.
    #[error("event bus consumer is not running")]
    NotRunning,
}
