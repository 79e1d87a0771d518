//! Core orchestration engine for the Kiln printer fleet.
//!
//! Holds the job queue and its persisted state machine, the routing
//! engine, the safety coordinator, progress estimation, print watchers,
//! pipelines, and the lookup tables (material substitution, print DNA)
//! the router consumes. [`service::KilnService`] wires the collaborators
//! together at startup.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod material;
pub mod pipelines;
pub mod print_dna;
pub mod progress;
pub mod queue;
pub mod router;
pub mod safety;
pub mod service;
pub mod tools;
pub mod watcher;

pub use queue::{JobRequest, JobStatus, PrintJob, PrintQueue};
pub use router::{JobRouter, PrinterInfo, PrinterScore, RoutingCriteria, RoutingResult};
pub use safety::{EmergencyCoordinator, EmergencyReason, EmergencyRecord, SafetyInterlock};
pub use service::KilnService;
pub use watcher::{PrintWatcher, WatchOutcome, WatcherRegistry};

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {0:?} not found")]
    JobNotFound(String),

    #[error("invalid state transition for job {job_id:?}: {detail}")]
    InvalidStateTransition { job_id: String, detail: String },

    #[error("{0}")]
    Validation(String),

    #[error("preflight failed: {0}")]
    PreflightFailed(String),

    #[error("printer error: {0}")]
    Printer(#[from] kiln_printers::PrinterError),

    #[error("persistence error: {0}")]
    Store(#[from] kiln_store::StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Machine code from the error taxonomy, used by the tool surface.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::JobNotFound(_) => "NOT_FOUND",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::Validation(_) => "VALIDATION",
            EngineError::PreflightFailed(_) => "PREFLIGHT_FAILED",
            EngineError::Printer(err) => printer_error_code(err),
            EngineError::Store(_) => "INTERNAL",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

fn printer_error_code(err: &kiln_printers::PrinterError) -> &'static str {
    use kiln_printers::PrinterError;
    match err {
        PrinterError::Unreachable { .. } => "PRINTER_UNREACHABLE",
        PrinterError::Timeout { .. } => "TIMEOUT",
        PrinterError::Http { status: 429, .. } => "RATE_LIMITED",
        PrinterError::Http { .. } => "PRINTER_UNREACHABLE",
        PrinterError::Auth(_) => "AUTH",
        PrinterError::Unsupported(_) => "UNSUPPORTED",
        PrinterError::Busy(_) => "PRINTER_BUSY",
        PrinterError::Validation(_) => "VALIDATION",
        PrinterError::Protocol { .. } => "INTERNAL",
        PrinterError::File(_) => "FILE_ERROR",
        PrinterError::Io(_) => "INTERNAL",
    }
}

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
