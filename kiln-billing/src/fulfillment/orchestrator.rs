//! Server-side orchestration of proxy fulfillment requests.
//!
//! The price a client sees is never trusted: quotes are cached server-side
//! under an unguessable single-use token, and the order path re-derives
//! the fee from the cached price. The free-tier counter read and the
//! payment attempt are serialized per user so concurrent requests cannot
//! slip past the monthly limit together.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use kiln_events::{Event, EventBus, EventType};

use crate::fulfillment::{FulfillmentProvider, OrderRequest, OrderResult, Quote, QuoteRequest};
use crate::ledger::{BillingLedger, FeeCalculation};
use crate::licensing::LicenseTier;
use crate::now_ts;
use crate::payments::PaymentManager;
use crate::FulfillmentError;

/// Default lifetime of a server-side cached quote.
const QUOTE_TTL_SECONDS: f64 = 3600.0;
/// Relative price drift that blocks an order outright.
const DRIFT_BLOCK_THRESHOLD: f64 = 0.10;
/// Relative price drift that is surfaced as a warning.
const DRIFT_WARN_THRESHOLD: f64 = 0.005;

struct CachedQuoteEntry {
    total_price: f64,
    currency: String,
    provider: String,
    user_email: String,
    quote_id: String,
    expires_at: f64,
}

/// Response to a quote request: the provider quote, the Kiln fee, and the
/// token that must come back at order time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote: Quote,
    pub kiln_fee: FeeCalculation,
    pub total_with_fee: f64,
    pub quote_token: String,
}

/// Response to a successful order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order: OrderResult,
    pub kiln_fee: FeeCalculation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_drift_warning: Option<String>,
}

/// Orchestrates quote → payment → order with auto-refund on failure.
pub struct ProxyOrchestrator {
    ledger: Arc<BillingLedger>,
    payments: Arc<PaymentManager>,
    providers: Mutex<HashMap<String, Arc<dyn FulfillmentProvider>>>,
    quote_cache: Mutex<HashMap<String, CachedQuoteEntry>>,
    quote_ttl_seconds: f64,
    /// Per-user locks, lazily created, serializing the free-tier check and
    /// the payment attempt.
    user_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    bus: Option<Arc<EventBus>>,
}

impl ProxyOrchestrator {
    pub fn new(
        ledger: Arc<BillingLedger>,
        payments: Arc<PaymentManager>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let quote_ttl_seconds = std::env::var("KILN_QUOTE_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(QUOTE_TTL_SECONDS);
        Self {
            ledger,
            payments,
            providers: Mutex::new(HashMap::new()),
            quote_cache: Mutex::new(HashMap::new()),
            quote_ttl_seconds,
            user_locks: DashMap::new(),
            bus,
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn FulfillmentProvider>) {
        self.providers
            .lock()
            .insert(provider.name().to_string(), provider);
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn FulfillmentProvider>, FulfillmentError> {
        self.providers.lock().get(name).cloned().ok_or_else(|| {
            FulfillmentError::new(
                format!("fulfillment provider {name:?} is not registered"),
                "PROVIDER_NOT_FOUND",
            )
        })
    }

    fn user_lock(&self, user_email: &str) -> Arc<AsyncMutex<()>> {
        self.user_locks
            .entry(user_email.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(event_type, payload, "fulfillment"));
        }
    }

    /// Materials offered by a provider.
    pub async fn handle_materials(
        &self,
        provider_name: &str,
    ) -> Result<Vec<serde_json::Value>, FulfillmentError> {
        self.provider(provider_name)?.list_materials().await
    }

    /// Forward a quote request, compute the Kiln fee, and cache the quote
    /// server-side under a fresh single-use token.
    pub async fn handle_quote(
        &self,
        provider_name: &str,
        request: &QuoteRequest,
        user_email: &str,
    ) -> Result<QuoteResponse, FulfillmentError> {
        let provider = self.provider(provider_name)?;
        let quote = provider.get_quote(request).await?;

        let fee = self
            .ledger
            .calculate_fee(quote.total_price, Some(&quote.currency));

        let quote_token = Uuid::new_v4().simple().to_string();
        {
            let mut cache = self.quote_cache.lock();
            purge_expired(&mut cache);
            cache.insert(
                quote_token.clone(),
                CachedQuoteEntry {
                    total_price: quote.total_price,
                    currency: quote.currency.clone(),
                    provider: provider_name.to_string(),
                    user_email: user_email.to_string(),
                    quote_id: quote.quote_id.clone(),
                    expires_at: now_ts() + self.quote_ttl_seconds,
                },
            );
        }

        self.emit(
            EventType::FulfillmentQuoted,
            json!({
                "provider": provider_name,
                "quote_id": quote.quote_id,
                "total_price": quote.total_price,
            }),
        );

        Ok(QuoteResponse {
            total_with_fee: fee.total_cost,
            kiln_fee: fee,
            quote,
            quote_token,
        })
    }

    /// Place an order against a previously issued quote token.
    ///
    /// The token is consumed on entry (single use); validation failures
    /// surface the taxonomy codes QUOTE_NOT_FOUND, QUOTE_EXPIRED,
    /// PROVIDER_MISMATCH and OWNERSHIP_MISMATCH. A provider failure after
    /// capture refunds the fee; a confirmed price that drifted beyond the
    /// threshold refunds and aborts with PRICE_DRIFT_BLOCKED.
    pub async fn handle_order(
        &self,
        provider_name: &str,
        request: &OrderRequest,
        user_email: &str,
        user_tier: LicenseTier,
        quote_token: &str,
    ) -> Result<OrderResponse, FulfillmentError> {
        // Pop the token first: a quote authorises exactly one order
        // attempt at its price.
        let cached = self
            .quote_cache
            .lock()
            .remove(quote_token)
            .ok_or_else(|| {
                FulfillmentError::new(
                    "Quote not found or already used. Please request a new quote.",
                    "QUOTE_NOT_FOUND",
                )
            })?;

        if cached.expires_at < now_ts() {
            return Err(FulfillmentError::new(
                "Quote has expired. Please request a new quote.",
                "QUOTE_EXPIRED",
            ));
        }
        if cached.provider != provider_name {
            return Err(FulfillmentError::new(
                format!(
                    "Provider mismatch: quote was for {:?}, order specifies {provider_name:?}.",
                    cached.provider
                ),
                "PROVIDER_MISMATCH",
            ));
        }
        if !cached.user_email.is_empty()
            && !user_email.is_empty()
            && cached.user_email != user_email
        {
            tracing::warn!(
                quoted_for = %cached.user_email,
                ordered_by = %user_email,
                "order ownership mismatch"
            );
            return Err(FulfillmentError::new(
                "Quote was issued to a different user.",
                "OWNERSHIP_MISMATCH",
            ));
        }

        let provider = self.provider(provider_name)?;

        // The user-scoped section covers the free-tier counter read and
        // the payment attempt together.
        let user_lock = self.user_lock(user_email);
        let (fee, payment_id) = {
            let _guard = user_lock.lock().await;

            if !user_tier.unlimited_orders() {
                let used = self.ledger.network_jobs_this_month_for_user(user_email);
                let allowed = self.ledger.policy().free_tier_jobs as usize;
                if used >= allowed {
                    return Err(FulfillmentError::new(
                        format!(
                            "Free tier limit reached: {used}/{allowed} orders this month. \
                             Upgrade to Business tier for unlimited orders."
                        ),
                        "FREE_TIER_LIMIT",
                    ));
                }
            }

            // Fee from the server-authoritative price, never the client's.
            let fee = self
                .ledger
                .calculate_fee(cached.total_price, Some(&cached.currency));

            let charge_key = if cached.quote_id.is_empty() {
                quote_token.to_string()
            } else {
                cached.quote_id.clone()
            };
            let payment = self
                .payments
                .charge_fee(&charge_key, &fee, None)
                .await
                .map_err(|err| {
                    FulfillmentError::new(
                        format!("Fee collection failed: {err}"),
                        err.code.as_deref().unwrap_or("PAYMENT_FAILED"),
                    )
                })?;
            self.ledger.tag_charge_user(&charge_key, user_email);
            let payment_id =
                (!payment.payment_id.is_empty()).then(|| payment.payment_id.clone());
            (fee, payment_id)
        };

        // Place the order outside the user lock; the money decision is done.
        let order = match provider.place_order(request).await {
            Ok(order) => order,
            Err(err) => {
                self.refund_after_failure(payment_id.as_deref(), &err.message).await;
                self.emit(
                    EventType::FulfillmentFailed,
                    json!({"provider": provider_name, "quote_id": cached.quote_id, "error": err.message}),
                );
                return Err(err);
            }
        };

        // Price-drift guard: the confirmed price must match what was quoted.
        let mut price_drift_warning = None;
        if cached.total_price > 0.0 {
            let drift = (order.total_price - cached.total_price).abs() / cached.total_price;
            if drift > DRIFT_BLOCK_THRESHOLD {
                self.refund_after_failure(
                    payment_id.as_deref(),
                    "confirmed price drifted beyond threshold",
                )
                .await;
                return Err(FulfillmentError::new(
                    format!(
                        "Confirmed price {:.2} differs from quoted {:.2} by {:.1}%; order aborted and fee refunded.",
                        order.total_price,
                        cached.total_price,
                        drift * 100.0
                    ),
                    "PRICE_DRIFT_BLOCKED",
                ));
            }
            if drift > DRIFT_WARN_THRESHOLD {
                price_drift_warning = Some(format!(
                    "confirmed price {:.2} differs from quoted {:.2} by {:.2}%",
                    order.total_price,
                    cached.total_price,
                    drift * 100.0
                ));
            }
        }

        self.emit(
            EventType::FulfillmentOrdered,
            json!({
                "provider": provider_name,
                "order_id": order.order_id,
                "total_price": order.total_price,
            }),
        );

        Ok(OrderResponse {
            order,
            kiln_fee: fee,
            payment_id,
            price_drift_warning,
        })
    }

    async fn refund_after_failure(&self, payment_id: Option<&str>, reason: &str) {
        let Some(payment_id) = payment_id else {
            tracing::warn!(reason, "order failed; no payment to refund");
            return;
        };
        tracing::warn!(payment_id, reason, "order failed after capture; refunding");
        match self.payments.refund_fee(payment_id).await {
            Ok(_) => tracing::info!(payment_id, "fee refunded"),
            Err(err) => {
                tracing::error!(payment_id, error = %err, "REFUND FAILED — manual reconciliation required");
            }
        }
    }

    /// Order status passthrough.
    pub async fn handle_status(
        &self,
        provider_name: &str,
        order_id: &str,
    ) -> Result<OrderResult, FulfillmentError> {
        self.provider(provider_name)?.get_order_status(order_id).await
    }

    /// Order cancellation passthrough.
    pub async fn handle_cancel(
        &self,
        provider_name: &str,
        order_id: &str,
    ) -> Result<OrderResult, FulfillmentError> {
        let result = self.provider(provider_name)?.cancel_order(order_id).await?;
        self.emit(
            EventType::FulfillmentCancelled,
            json!({"provider": provider_name, "order_id": order_id}),
        );
        Ok(result)
    }

    /// Number of live (unexpired) cached quotes; used by tests and status
    /// endpoints.
    pub fn cached_quote_count(&self) -> usize {
        let mut cache = self.quote_cache.lock();
        purge_expired(&mut cache);
        cache.len()
    }
}

fn purge_expired(cache: &mut HashMap<String, CachedQuoteEntry>) {
    let now = now_ts();
    cache.retain(|_, entry| entry.expires_at >= now);
}
