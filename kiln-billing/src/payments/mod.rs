//! Payment rail abstraction.
//!
//! Each provider implements one rail (Stripe card, Circle USDC, …). The
//! [`PaymentManager`] composes providers, adds spend-limit enforcement,
//! per-job idempotency and lifecycle events.

pub mod circle;
pub mod manager;
pub mod stripe;

pub use circle::CircleProvider;
pub use manager::PaymentManager;
pub use stripe::StripeProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::PaymentError;

/// A payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentRail {
    Stripe,
    Circle,
}

impl PaymentRail {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentRail::Stripe => "stripe",
            PaymentRail::Circle => "circle",
        }
    }

    /// Rails settling on a blockchain; the `"crypto"` alias resolves to
    /// the first of these.
    pub fn is_crypto(&self) -> bool {
        matches!(self, PaymentRail::Circle)
    }
}

/// Lifecycle status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Authorized,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// A request to move money.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Idempotency key — one payment per job.
    pub job_id: String,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Outcome of a payment operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub success: bool,
    /// Provider payment id; empty for synthetic (waived) successes.
    pub payment_id: String,
    pub status: PaymentStatus,
    pub amount: f64,
    pub currency: String,
    pub rail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl PaymentResult {
    /// Synthetic success used for waived/zero fees: no provider call, no
    /// payment id.
    pub fn synthetic(status: PaymentStatus, amount: f64, currency: &str) -> Self {
        Self {
            success: true,
            payment_id: String::new(),
            status,
            amount,
            currency: currency.to_string(),
            rail: String::new(),
            tx_hash: None,
        }
    }
}

/// One payment rail implementation.
///
/// `create_payment`, `get_payment_status` and `refund_payment` are
/// mandatory; authorize/capture/cancel are optional and default to
/// `Unsupported` so the manager can synthesize a hold instead.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;
    fn rail(&self) -> PaymentRail;
    fn supported_currencies(&self) -> Vec<String>;

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError>;
    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentResult, PaymentError>;
    async fn refund_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError>;

    /// Place a hold without capturing.
    async fn authorize_payment(
        &self,
        _request: &PaymentRequest,
    ) -> Result<PaymentResult, PaymentError> {
        Err(PaymentError::with_code(
            format!("{} does not support authorize", self.name()),
            "UNSUPPORTED",
        ))
    }

    /// Capture a previously placed hold.
    async fn capture_payment(&self, _payment_id: &str) -> Result<PaymentResult, PaymentError> {
        Err(PaymentError::with_code(
            format!("{} does not support capture", self.name()),
            "UNSUPPORTED",
        ))
    }

    /// Release a previously placed hold.
    async fn cancel_payment(&self, _payment_id: &str) -> Result<PaymentResult, PaymentError> {
        Err(PaymentError::with_code(
            format!("{} does not support cancel", self.name()),
            "UNSUPPORTED",
        ))
    }

    /// URL where the user can set up a payment method, when the rail
    /// offers one.
    fn create_setup_url(&self) -> Option<String> {
        None
    }
}
