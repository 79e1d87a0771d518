//! SQLite persistence layer for the Kiln fleet orchestrator.
//!
//! One durable store is shared across modules: jobs, events, printers,
//! settings, billing charges, payments, payment methods and print-DNA
//! history all live in a single database opened in WAL mode with a 5 s
//! busy timeout. Writes are serialized through the store's connection lock.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod records;

pub use db::KilnDb;
pub use records::{
    ChargeRecord, JobRecord, MonthlySummary, PaymentMethodRecord, PaymentRecord, PrintDnaRow,
    PrinterRecord, StoredEvent,
};

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store path error: {0}")]
    Path(String),
}
