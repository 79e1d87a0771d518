//! Billing-side service wiring.
//!
//! Mirrors the engine's central service struct: the ledger, payment
//! manager, fulfillment orchestrator, quote cache and reputation engine
//! are constructed once at startup as collaborator dependencies, with no
//! hidden initialization order between them — the only shared dependency
//! is the durable store.

use std::sync::Arc;

use kiln_events::EventBus;
use kiln_store::KilnDb;

use crate::fulfillment::ProxyOrchestrator;
use crate::ledger::{BillingLedger, FeePolicy, SpendLimits};
use crate::payments::{CircleProvider, PaymentManager, StripeProvider};
use crate::quote_cache::{QuoteCache, QuoteCacheConfig};
use crate::reputation::ReputationEngine;

/// The assembled billing stack.
pub struct BillingPlatform {
    pub ledger: Arc<BillingLedger>,
    pub payments: Arc<PaymentManager>,
    pub orchestrator: Arc<ProxyOrchestrator>,
    pub quote_cache: Arc<QuoteCache>,
    pub reputation: Arc<ReputationEngine>,
}

impl BillingPlatform {
    /// Build the stack over an opened store and event bus.
    ///
    /// Payment rails are auto-registered from the environment:
    /// `KILN_STRIPE_SECRET_KEY` enables Stripe; Circle needs a full wallet
    /// configuration and is registered by the caller.
    pub fn new(
        db: Arc<KilnDb>,
        bus: Option<Arc<EventBus>>,
        policy: FeePolicy,
        limits: SpendLimits,
        default_rail: Option<String>,
    ) -> Self {
        let ledger = Arc::new(BillingLedger::with_store(policy, limits, db.clone()));
        let payments = Arc::new(PaymentManager::new(
            ledger.clone(),
            default_rail,
            Some(db),
            bus.clone(),
        ));

        if let Ok(key) = std::env::var("KILN_STRIPE_SECRET_KEY") {
            if !key.is_empty() {
                payments.register_provider(Arc::new(StripeProvider::new(&key)));
                tracing::info!("registered Stripe provider from environment");
            }
        }

        let orchestrator = Arc::new(ProxyOrchestrator::new(
            ledger.clone(),
            payments.clone(),
            bus,
        ));

        Self {
            ledger,
            payments,
            orchestrator,
            quote_cache: Arc::new(QuoteCache::new(QuoteCacheConfig::default())),
            reputation: Arc::new(ReputationEngine::new()),
        }
    }

    /// Register a Circle USDC rail (needs wallet configuration the
    /// environment alone cannot provide).
    pub fn register_circle(&self, provider: CircleProvider) {
        self.payments.register_provider(Arc::new(provider));
    }
}
