//! Billing and payment orchestration for external-fulfillment orders.
//!
//! This is the money-on-the-line part of Kiln: the [`BillingLedger`]
//! enforces the fee policy, free tier and spend limits; the
//! [`PaymentManager`] abstracts payment rails with authorize/capture and
//! refund-on-failure; the [`ProxyOrchestrator`] issues single-use quote
//! tokens and gates order placement on payment. Correctness under
//! concurrency and partial failure is the design driver throughout.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod fulfillment;
pub mod ledger;
pub mod licensing;
pub mod payments;
pub mod platform;
pub mod quote_cache;
pub mod reputation;

pub use fulfillment::{
    FulfillmentProvider, OrderRequest, OrderResult, ProxyOrchestrator, Quote, QuoteRequest,
};
pub use ledger::{BillingLedger, ChargeEntry, FeeCalculation, FeePolicy, SpendLimits};
pub use licensing::LicenseTier;
pub use payments::{
    PaymentManager, PaymentProvider, PaymentRail, PaymentRequest, PaymentResult, PaymentStatus,
};
pub use platform::BillingPlatform;
pub use quote_cache::{CachedQuote, QuoteCache, QuoteCacheConfig};
pub use reputation::{OperatorProfile, OrderFeedback, ReputationEngine};

use thiserror::Error;

/// Error raised by payment rails and the payment manager.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PaymentError {
    pub message: String,
    /// Machine code, e.g. `SPEND_LIMIT`, `CARD_DECLINED`.
    pub code: Option<String>,
}

impl PaymentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Error raised by fulfillment providers and the orchestrator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FulfillmentError {
    pub message: String,
    /// Machine code, e.g. `QUOTE_NOT_FOUND`, `PRICE_DRIFT_BLOCKED`.
    pub code: String,
}

impl FulfillmentError {
    pub fn new(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            code: code.to_string(),
        }
    }
}

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
