//! Uniform printer abstraction for the Kiln fleet orchestrator.
//!
//! Every printer backend (OctoPrint, Klipper/Moonraker, Prusa Link) exposes
//! the same operational contract through [`PrinterAdapter`], so the rest of
//! the stack can drive any supported printer without knowledge of the
//! underlying protocol. Adapters advertise [`PrinterCapabilities`]; features
//! behind a `false` flag raise [`PrinterError::Unsupported`] rather than
//! silently doing nothing.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adapter;
pub mod http;
pub mod moonraker;
pub mod octoprint;
pub mod profiles;
pub mod prusalink;
pub mod registry;
pub mod types;

pub use adapter::{FirmwareResumeParams, PrinterAdapter};
pub use profiles::{get_profile, SafetyProfile};
pub use registry::PrinterRegistry;
pub use types::{
    DeviceType, FirmwareComponent, FirmwareStatus, FirmwareUpdateResult, JobProgress,
    PrintResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus, UploadResult,
};

use thiserror::Error;

/// Result type for printer operations.
pub type PrinterResult<T> = Result<T, PrinterError>;

/// Errors raised by printer adapters.
///
/// Vendor-level failures are wrapped at the adapter boundary; the `source`
/// chain preserves the underlying transport error for logs.
#[derive(Debug, Error)]
pub enum PrinterError {
    /// The printer could not be reached at all.
    #[error("printer unreachable: {message}")]
    Unreachable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request was sent but timed out.
    #[error("request timed out: {message}")]
    Timeout {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The vendor API returned a non-success HTTP status.
    #[error("printer returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Authentication is missing or was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The adapter does not support the requested feature.
    #[error("{0}")]
    Unsupported(String),

    /// The printer is busy and cannot accept the command.
    #[error("printer busy: {0}")]
    Busy(String),

    /// Caller-supplied input failed validation.
    #[error("{0}")]
    Validation(String),

    /// The vendor response could not be interpreted.
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A local file was missing or unreadable.
    #[error("file error: {0}")]
    File(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrinterError {
    /// True for failures worth an automatic retry at the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PrinterError::Unreachable { .. } | PrinterError::Timeout { .. }
        ) || matches!(self, PrinterError::Http { status, .. }
                if matches!(status, 429 | 502 | 503 | 504))
    }
}
