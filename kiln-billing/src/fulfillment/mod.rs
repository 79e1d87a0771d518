//! External-manufacturing fulfillment: provider contract and the proxy
//! orchestrator that gates orders on payment.

pub mod orchestrator;

pub use orchestrator::{OrderResponse, ProxyOrchestrator, QuoteResponse};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::FulfillmentError;

/// Parameters for a quote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub file_path: String,
    pub material: String,
    pub quantity: u32,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A quote from a fulfillment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub provider: String,
    pub total_price: f64,
    pub currency: String,
    pub lead_time_days: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Parameters for placing an order against a previous quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Provider-assigned quote id from the original quote.
    pub quote_id: String,
    #[serde(default)]
    pub shipping_address: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The provider's view of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: String,
    pub total_price: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_url: Option<String>,
}

/// One external manufacturing service.
#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Materials the provider can print in.
    async fn list_materials(&self) -> Result<Vec<Value>, FulfillmentError>;

    async fn get_quote(&self, request: &QuoteRequest) -> Result<Quote, FulfillmentError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, FulfillmentError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult, FulfillmentError>;

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResult, FulfillmentError>;
}
