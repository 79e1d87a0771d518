//! Rail composition, idempotent charging and lifecycle events.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use kiln_events::{Event, EventBus, EventType};
use kiln_store::{KilnDb, PaymentRecord};

use crate::ledger::{BillingLedger, FeeCalculation};
use crate::now_ts;
use crate::payments::{PaymentProvider, PaymentRequest, PaymentResult, PaymentStatus};
use crate::PaymentError;

/// Composes payment providers and enforces the flow invariants:
/// waived fees short-circuit, spend limits precheck every attempt, and a
/// job id already charged replays the recorded result without touching
/// the provider.
pub struct PaymentManager {
    /// Registration order matters: the first provider is the fallback rail.
    providers: RwLock<Vec<Arc<dyn PaymentProvider>>>,
    default_rail: Option<String>,
    ledger: Arc<BillingLedger>,
    db: Option<Arc<KilnDb>>,
    bus: Option<Arc<EventBus>>,
    /// Short-lived per-job locks serializing concurrent charges.
    job_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl PaymentManager {
    pub fn new(
        ledger: Arc<BillingLedger>,
        default_rail: Option<String>,
        db: Option<Arc<KilnDb>>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            default_rail,
            ledger,
            db,
            bus,
            job_locks: DashMap::new(),
        }
    }

    /// Register a provider. Later registrations with the same name replace
    /// the earlier one.
    pub fn register_provider(&self, provider: Arc<dyn PaymentProvider>) {
        let mut providers = self.providers.write();
        providers.retain(|p| p.name() != provider.name());
        providers.push(provider);
    }

    /// Look up a provider by name.
    pub fn get_provider(&self, name: &str) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Names of registered rails, in registration order.
    pub fn available_rails(&self) -> Vec<String> {
        self.providers.read().iter().map(|p| p.name().to_string()).collect()
    }

    /// Resolve the active rail: caller-specified > configured default >
    /// first registered. The `"crypto"` alias picks the first
    /// crypto-capable provider.
    pub fn resolve_provider(
        &self,
        rail: Option<&str>,
    ) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
        let providers = self.providers.read();
        if providers.is_empty() {
            return Err(PaymentError::with_code(
                "No payment providers registered",
                "NO_PROVIDERS",
            ));
        }

        let wanted = rail.map(str::to_string).or_else(|| self.default_rail.clone());
        match wanted.as_deref() {
            None => Ok(providers[0].clone()),
            Some("crypto") => providers
                .iter()
                .find(|p| p.rail().is_crypto())
                .cloned()
                .ok_or_else(|| {
                    PaymentError::with_code("no crypto-capable provider registered", "NO_PROVIDERS")
                }),
            Some(name) => providers
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .ok_or_else(|| {
                    PaymentError::with_code(
                        format!("payment provider {name:?} is not registered"),
                        "NOT_REGISTERED",
                    )
                }),
        }
    }

    /// Name of the rail a charge would use right now.
    pub fn active_rail(&self) -> Result<String, PaymentError> {
        Ok(self.resolve_provider(None)?.name().to_string())
    }

    /// Spend-limit precheck, exposed for callers that want to validate
    /// before quoting.
    pub fn check_spend_limits(&self, proposed_fee: f64) -> (bool, Option<String>) {
        self.ledger.check_spend_limits(proposed_fee)
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(event_type, payload, "payments"));
        }
    }

    fn persist_payment(&self, job_id: &str, result: &PaymentResult, status: &str) {
        let Some(db) = &self.db else {
            return;
        };
        let record = PaymentRecord {
            payment_id: if result.payment_id.is_empty() {
                format!("synthetic-{job_id}")
            } else {
                result.payment_id.clone()
            },
            job_id: job_id.to_string(),
            rail: result.rail.clone(),
            amount: result.amount,
            currency: result.currency.clone(),
            status: status.to_string(),
            tx_hash: result.tx_hash.clone(),
            created_at: now_ts(),
        };
        if let Err(err) = db.save_payment(&record) {
            tracing::warn!(job_id, error = %err, "failed to persist payment");
        }
    }

    fn job_lock(&self, job_id: &str) -> Arc<AsyncMutex<()>> {
        self.job_locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn spend_limit_precheck(&self, fee: &FeeCalculation) -> Result<(), PaymentError> {
        let (ok, reason) = self.ledger.check_spend_limits(fee.fee_amount);
        if ok {
            return Ok(());
        }
        let reason = reason.unwrap_or_else(|| "spend limit exceeded".into());
        self.emit(
            EventType::SpendLimitReached,
            json!({"fee_amount": fee.fee_amount, "reason": reason}),
        );
        Err(PaymentError::with_code(
            format!("Spend limit exceeded: {reason}"),
            "SPEND_LIMIT",
        ))
    }

    fn cached_result(&self, job_id: &str) -> Option<PaymentResult> {
        let charge = self.ledger.get_job_charge(job_id)?;
        match charge.payment_status.as_str() {
            "completed" | "waived" => Some(PaymentResult {
                success: true,
                payment_id: charge.payment_id.unwrap_or_default(),
                status: PaymentStatus::Completed,
                amount: charge.fee.fee_amount,
                currency: charge.fee.currency,
                rail: charge.payment_rail.unwrap_or_default(),
                tx_hash: None,
            }),
            _ => None,
        }
    }

    /// Charge the network fee for a job. Idempotent on `job_id`: a
    /// completed charge replays its recorded result and causes no second
    /// provider call.
    pub async fn charge_fee(
        &self,
        job_id: &str,
        fee: &FeeCalculation,
        rail: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        // Waived fees short-circuit before any lock or provider work.
        if fee.waived || fee.fee_amount <= 0.0 {
            self.ledger
                .record_charge(job_id, fee, None, None, Some("waived"));
            return Ok(PaymentResult::synthetic(
                PaymentStatus::Completed,
                0.0,
                &fee.currency,
            ));
        }

        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        if let Some(cached) = self.cached_result(job_id) {
            tracing::debug!(job_id, "charge replayed from ledger");
            return Ok(cached);
        }

        self.spend_limit_precheck(fee)?;
        let provider = self.resolve_provider(rail)?;

        let request = PaymentRequest {
            job_id: job_id.to_string(),
            amount: fee.fee_amount,
            currency: fee.currency.clone(),
            description: format!("Kiln network fee for job {job_id}"),
            metadata: serde_json::Map::new(),
        };

        self.emit(
            EventType::PaymentInitiated,
            json!({"job_id": job_id, "amount": fee.fee_amount, "rail": provider.name()}),
        );

        match provider.create_payment(&request).await {
            Ok(result) => {
                self.persist_payment(job_id, &result, "completed");
                self.ledger.record_charge(
                    job_id,
                    fee,
                    Some(&result.payment_id),
                    Some(provider.name()),
                    Some("completed"),
                );
                self.emit(
                    EventType::PaymentCompleted,
                    json!({"job_id": job_id, "payment_id": result.payment_id}),
                );
                Ok(result)
            }
            Err(err) => {
                let failed = PaymentResult {
                    success: false,
                    payment_id: String::new(),
                    status: PaymentStatus::Failed,
                    amount: fee.fee_amount,
                    currency: fee.currency.clone(),
                    rail: provider.name().to_string(),
                    tx_hash: None,
                };
                self.persist_payment(job_id, &failed, "failed");
                self.emit(
                    EventType::PaymentFailed,
                    json!({"job_id": job_id, "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    /// Place a hold for a quoted fee. Providers without native authorize
    /// support yield a synthetic hold with an empty id; capturing an empty
    /// hold falls back to a normal charge.
    pub async fn authorize_fee(
        &self,
        quote_id: &str,
        fee: &FeeCalculation,
        rail: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        if fee.waived || fee.fee_amount <= 0.0 {
            return Ok(PaymentResult::synthetic(
                PaymentStatus::Authorized,
                0.0,
                &fee.currency,
            ));
        }

        self.spend_limit_precheck(fee)?;
        let provider = self.resolve_provider(rail)?;

        let request = PaymentRequest {
            job_id: quote_id.to_string(),
            amount: fee.fee_amount,
            currency: fee.currency.clone(),
            description: format!("Kiln network fee hold for quote {quote_id}"),
            metadata: serde_json::Map::new(),
        };

        match provider.authorize_payment(&request).await {
            Ok(result) => Ok(result),
            Err(err) if err.code.as_deref() == Some("UNSUPPORTED") => {
                // No native hold: synthesize one and charge at capture time.
                Ok(PaymentResult {
                    success: true,
                    payment_id: String::new(),
                    status: PaymentStatus::Authorized,
                    amount: fee.fee_amount,
                    currency: fee.currency.clone(),
                    rail: provider.name().to_string(),
                    tx_hash: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Capture a hold against a placed order. An empty `hold_id` means no
    /// real hold exists, so this falls back to `charge_fee`.
    pub async fn capture_fee(
        &self,
        hold_id: &str,
        order_id: &str,
        fee: &FeeCalculation,
        rail: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        if hold_id.is_empty() {
            return self.charge_fee(order_id, fee, rail).await;
        }

        let provider = self.resolve_provider(rail)?;
        let result = provider.capture_payment(hold_id).await?;
        self.persist_payment(order_id, &result, "completed");
        self.ledger.record_charge(
            order_id,
            fee,
            Some(&result.payment_id),
            Some(provider.name()),
            Some("completed"),
        );
        self.emit(
            EventType::PaymentCompleted,
            json!({"job_id": order_id, "payment_id": result.payment_id}),
        );
        Ok(result)
    }

    /// Release a hold. An empty id is a successful no-op; providers
    /// without native cancel get a synthetic cancelled result.
    pub async fn cancel_fee(&self, hold_id: &str) -> Result<PaymentResult, PaymentError> {
        if hold_id.is_empty() {
            return Ok(PaymentResult::synthetic(PaymentStatus::Cancelled, 0.0, "USD"));
        }
        let provider = self.resolve_provider(None)?;
        match provider.cancel_payment(hold_id).await {
            Ok(result) => Ok(result),
            Err(err) if err.code.as_deref() == Some("UNSUPPORTED") => Ok(PaymentResult {
                success: true,
                payment_id: hold_id.to_string(),
                status: PaymentStatus::Cancelled,
                amount: 0.0,
                currency: "USD".into(),
                rail: provider.name().to_string(),
                tx_hash: None,
            }),
            Err(err) => Err(err),
        }
    }

    /// Refund a captured payment (post-order failure path).
    pub async fn refund_fee(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let provider = self.resolve_provider(None)?;
        let result = provider.refund_payment(payment_id).await?;
        if let Some(db) = &self.db {
            if let Err(err) = db.update_payment_status(payment_id, "refunded", None) {
                tracing::warn!(payment_id, error = %err, "failed to mark payment refunded");
            }
        }
        self.emit(
            EventType::PaymentRefunded,
            json!({"payment_id": payment_id}),
        );
        Ok(result)
    }

    /// Setup URL for a rail that supports interactive payment-method setup.
    pub fn setup_url(&self, rail: &str) -> Result<String, PaymentError> {
        let provider = self.get_provider(rail).ok_or_else(|| {
            PaymentError::with_code(
                format!("payment provider {rail:?} is not registered"),
                "NOT_REGISTERED",
            )
        })?;
        provider.create_setup_url().ok_or_else(|| {
            PaymentError::with_code(
                format!("{rail} does not support setup URLs"),
                "UNSUPPORTED",
            )
        })
    }

    /// Billing overview for one user.
    pub fn billing_status(&self, user_id: &str) -> serde_json::Value {
        let methods = self
            .db
            .as_ref()
            .and_then(|db| db.list_payment_methods(user_id).ok())
            .unwrap_or_default();
        let default_method = self
            .db
            .as_ref()
            .and_then(|db| db.get_default_payment_method(user_id).ok())
            .flatten();
        json!({
            "user_id": user_id,
            "month_revenue": self.ledger.monthly_revenue(None, None),
            "fee_policy": self.ledger.policy(),
            "spend_limits": self.ledger.limits(),
            "payment_methods": methods,
            "default_payment_method": default_method,
            "available_rails": self.available_rails(),
        })
    }

    /// Recent charges, newest first.
    pub fn billing_history(&self, limit: usize) -> Vec<crate::ledger::ChargeEntry> {
        self.ledger.list_charges(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FeePolicy, SpendLimits};
    use crate::payments::PaymentRail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        name: String,
        rail: PaymentRail,
        fail: bool,
        auth_capable: bool,
        charges: AtomicUsize,
        auths: AtomicUsize,
        captures: AtomicUsize,
        cancels: AtomicUsize,
        refunds: AtomicUsize,
    }

    impl FakeProvider {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                rail: PaymentRail::Stripe,
                fail: false,
                auth_capable: false,
                charges: AtomicUsize::new(0),
                auths: AtomicUsize::new(0),
                captures: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                refunds: AtomicUsize::new(0),
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail: true,
                ..Self::named(name)
            }
        }

        fn auth_capable(name: &str) -> Self {
            Self {
                auth_capable: true,
                ..Self::named(name)
            }
        }

        fn crypto(name: &str) -> Self {
            Self {
                rail: PaymentRail::Circle,
                ..Self::named(name)
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn rail(&self) -> PaymentRail {
            self.rail
        }
        fn supported_currencies(&self) -> Vec<String> {
            vec!["USD".into()]
        }
        async fn create_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentResult, PaymentError> {
            let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(PaymentError::with_code("card declined", "CARD_DECLINED"));
            }
            Ok(PaymentResult {
                success: true,
                payment_id: format!("pi_{n}"),
                status: PaymentStatus::Completed,
                amount: request.amount,
                currency: request.currency.clone(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
        async fn get_payment_status(
            &self,
            payment_id: &str,
        ) -> Result<PaymentResult, PaymentError> {
            Ok(PaymentResult {
                success: true,
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Completed,
                amount: 0.0,
                currency: "USD".into(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
        async fn refund_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
            self.refunds.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentResult {
                success: true,
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Refunded,
                amount: 0.0,
                currency: "USD".into(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
        async fn authorize_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentResult, PaymentError> {
            if !self.auth_capable {
                return Err(PaymentError::with_code("no auth", "UNSUPPORTED"));
            }
            self.auths.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentResult {
                success: true,
                payment_id: "pi_hold_123".into(),
                status: PaymentStatus::Authorized,
                amount: request.amount,
                currency: request.currency.clone(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
        async fn capture_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
            if !self.auth_capable {
                return Err(PaymentError::with_code("no capture", "UNSUPPORTED"));
            }
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentResult {
                success: true,
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Completed,
                amount: 5.0,
                currency: "USD".into(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
        async fn cancel_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
            if !self.auth_capable {
                return Err(PaymentError::with_code("no cancel", "UNSUPPORTED"));
            }
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentResult {
                success: true,
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Cancelled,
                amount: 5.0,
                currency: "USD".into(),
                rail: self.name.clone(),
                tx_hash: None,
            })
        }
    }

    fn ledger_no_free_tier() -> Arc<BillingLedger> {
        Arc::new(BillingLedger::new(FeePolicy {
            free_tier_jobs: 0,
            ..FeePolicy::default()
        }))
    }

    fn manager_with(provider: FakeProvider) -> (PaymentManager, Arc<FakeProvider>) {
        let ledger = ledger_no_free_tier();
        let name = provider.name.clone();
        let provider = Arc::new(provider);
        let manager = PaymentManager::new(ledger, Some(name), None, None);
        manager.register_provider(provider.clone());
        (manager, provider)
    }

    #[tokio::test]
    async fn successful_charge_records_ledger_and_calls_provider_once() {
        let (manager, provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(100.0, None);

        let result = manager.charge_fee("order-1", &fee, None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.payment_id, "pi_1");
        assert_eq!(provider.charges.load(Ordering::SeqCst), 1);

        let charges = manager.ledger.list_charges(10);
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].job_id, "order-1");
        assert_eq!(charges[0].fee.fee_amount, 5.0);
        assert_eq!(charges[0].payment_status, "completed");
    }

    #[tokio::test]
    async fn waived_fee_never_touches_provider() {
        let ledger = Arc::new(BillingLedger::new(FeePolicy::default())); // 5 free
        let provider = Arc::new(FakeProvider::named("fake"));
        let manager = PaymentManager::new(ledger.clone(), None, None, None);
        manager.register_provider(provider.clone());

        let fee = ledger.calculate_fee(100.0, None);
        assert!(fee.waived);
        let result = manager.charge_fee("order-free", &fee, None).await.unwrap();

        assert!(result.success);
        assert!(result.payment_id.is_empty());
        assert_eq!(provider.charges.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.list_charges(10)[0].payment_status, "waived");
    }

    #[tokio::test]
    async fn zero_fee_short_circuits() {
        let (manager, provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(0.0, None);
        let result = manager.charge_fee("order-zero", &fee, None).await.unwrap();
        assert!(result.success);
        assert_eq!(provider.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_job_id_replays_without_provider_call() {
        let (manager, provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(100.0, None);

        let first = manager.charge_fee("order-dup", &fee, None).await.unwrap();
        let second = manager.charge_fee("order-dup", &fee, None).await.unwrap();

        assert_eq!(provider.charges.load(Ordering::SeqCst), 1);
        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(second.amount, 5.0);
        assert_eq!(manager.ledger.list_charges(10).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_same_job_charges_once() {
        let ledger = ledger_no_free_tier();
        let provider = Arc::new(FakeProvider::named("fake"));
        let manager = Arc::new(PaymentManager::new(ledger.clone(), None, None, None));
        manager.register_provider(provider.clone());

        let fee = ledger.calculate_fee(100.0, None);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let fee = fee.clone();
            handles.push(tokio::spawn(async move {
                manager.charge_fee("concurrent-order", &fee, None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(provider.charges.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.list_charges(10).len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_propagates_and_persists() {
        let db = Arc::new(KilnDb::open_in_memory().unwrap());
        let ledger = ledger_no_free_tier();
        let provider = Arc::new(FakeProvider::failing("fake"));
        let manager = PaymentManager::new(ledger.clone(), None, Some(db.clone()), None);
        manager.register_provider(provider.clone());

        let fee = ledger.calculate_fee(100.0, None);
        let err = manager.charge_fee("order-fail", &fee, None).await.unwrap_err();
        assert!(err.to_string().contains("card declined"));
        assert_eq!(provider.charges.load(Ordering::SeqCst), 1);
        // No completed charge in the ledger, so a retry may attempt again.
        assert!(ledger.get_job_charge("order-fail").is_none());
    }

    #[tokio::test]
    async fn spend_limit_blocks_before_provider() {
        let ledger = Arc::new(BillingLedger::with_limits(
            FeePolicy {
                free_tier_jobs: 0,
                ..FeePolicy::default()
            },
            SpendLimits {
                max_per_order: 1.0,
                ..SpendLimits::default()
            },
        ));
        let provider = Arc::new(FakeProvider::named("fake"));
        let manager = PaymentManager::new(ledger.clone(), None, None, None);
        manager.register_provider(provider.clone());

        let fee = ledger.calculate_fee(100.0, None); // $5 fee, $1 limit
        let err = manager.charge_fee("order-limit", &fee, None).await.unwrap_err();
        assert!(err.to_string().contains("Spend limit"));
        assert_eq!(err.code.as_deref(), Some("SPEND_LIMIT"));
        assert_eq!(provider.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rail_resolution_order() {
        let ledger = ledger_no_free_tier();
        let manager = PaymentManager::new(ledger.clone(), Some("stripe".into()), None, None);
        let stripe = Arc::new(FakeProvider::named("stripe"));
        let circle = Arc::new(FakeProvider::crypto("circle"));
        manager.register_provider(stripe.clone());
        manager.register_provider(circle.clone());

        assert_eq!(manager.active_rail().unwrap(), "stripe");

        // Explicit rail overrides the default.
        let fee = ledger.calculate_fee(100.0, None);
        manager.charge_fee("order-circle", &fee, Some("circle")).await.unwrap();
        assert_eq!(circle.charges.load(Ordering::SeqCst), 1);
        assert_eq!(stripe.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crypto_alias_resolves_to_crypto_rail() {
        let ledger = ledger_no_free_tier();
        let manager = PaymentManager::new(ledger, Some("crypto".into()), None, None);
        manager.register_provider(Arc::new(FakeProvider::named("stripe")));
        manager.register_provider(Arc::new(FakeProvider::crypto("circle")));
        assert_eq!(manager.active_rail().unwrap(), "circle");
    }

    #[tokio::test]
    async fn no_providers_is_an_error() {
        let manager = PaymentManager::new(ledger_no_free_tier(), None, None, None);
        let err = manager.active_rail().unwrap_err();
        assert!(err.to_string().contains("No payment providers"));
    }

    #[tokio::test]
    async fn unknown_rail_is_not_registered() {
        let (manager, _provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(100.0, None);
        let err = manager
            .charge_fee("order-x", &fee, Some("nonexistent"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn authorize_and_capture_with_native_support() {
        let (manager, provider) = manager_with(FakeProvider::auth_capable("auth"));
        let fee = manager.ledger.calculate_fee(100.0, None);

        let hold = manager.authorize_fee("quote-1", &fee, None).await.unwrap();
        assert_eq!(hold.status, PaymentStatus::Authorized);
        assert_eq!(hold.payment_id, "pi_hold_123");
        assert_eq!(provider.auths.load(Ordering::SeqCst), 1);

        let captured = manager
            .capture_fee("pi_hold_123", "order-1", &fee, None)
            .await
            .unwrap();
        assert_eq!(captured.status, PaymentStatus::Completed);
        assert_eq!(provider.captures.load(Ordering::SeqCst), 1);

        let charges = manager.ledger.list_charges(10);
        assert_eq!(charges[0].job_id, "order-1");
        assert_eq!(charges[0].payment_status, "completed");
    }

    #[tokio::test]
    async fn authorize_synthesizes_hold_without_native_support() {
        let (manager, provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(100.0, None);
        let hold = manager.authorize_fee("quote-3", &fee, None).await.unwrap();
        assert_eq!(hold.status, PaymentStatus::Authorized);
        assert!(hold.payment_id.is_empty());
        assert_eq!(provider.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capture_of_empty_hold_falls_back_to_charge() {
        let (manager, provider) = manager_with(FakeProvider::named("fake"));
        let fee = manager.ledger.calculate_fee(100.0, None);
        let result = manager.capture_fee("", "order-2", &fee, None).await.unwrap();
        assert!(result.success);
        assert_eq!(provider.charges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorize_waived_skips_hold_and_capture_is_noop() {
        let ledger = Arc::new(BillingLedger::new(FeePolicy::default()));
        let provider = Arc::new(FakeProvider::auth_capable("auth"));
        let manager = PaymentManager::new(ledger.clone(), None, None, None);
        manager.register_provider(provider.clone());

        let fee = ledger.calculate_fee(100.0, None);
        assert!(fee.waived);
        let hold = manager.authorize_fee("quote-free", &fee, None).await.unwrap();
        assert!(hold.payment_id.is_empty());
        assert_eq!(provider.auths.load(Ordering::SeqCst), 0);

        let captured = manager.capture_fee("", "order-free", &fee, None).await.unwrap();
        assert!(captured.success);
        assert_eq!(provider.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_fee_paths() {
        let (manager, provider) = manager_with(FakeProvider::auth_capable("auth"));
        let result = manager.cancel_fee("pi_hold_123").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Cancelled);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);

        // Empty id is a successful no-op.
        let result = manager.cancel_fee("").await.unwrap();
        assert!(result.success);

        // Unsupported cancel synthesizes success.
        let (manager, _) = manager_with(FakeProvider::named("fake"));
        let result = manager.cancel_fee("pi_fake").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn events_emitted_for_lifecycle() {
        let bus = Arc::new(EventBus::new());
        let ledger = ledger_no_free_tier();
        let manager = PaymentManager::new(ledger.clone(), None, None, Some(bus.clone()));
        manager.register_provider(Arc::new(FakeProvider::named("fake")));

        let fee = ledger.calculate_fee(100.0, None);
        manager.charge_fee("order-evt", &fee, None).await.unwrap();
        assert_eq!(bus.recent_events(Some(EventType::PaymentInitiated), 10).len(), 1);
        assert_eq!(bus.recent_events(Some(EventType::PaymentCompleted), 10).len(), 1);

        let manager_fail = PaymentManager::new(ledger.clone(), None, None, Some(bus.clone()));
        manager_fail.register_provider(Arc::new(FakeProvider::failing("fake")));
        let fee = ledger.calculate_fee(100.0, None);
        let _ = manager_fail.charge_fee("order-evt-fail", &fee, None).await;
        assert_eq!(bus.recent_events(Some(EventType::PaymentFailed), 10).len(), 1);
    }

    #[tokio::test]
    async fn setup_url_paths() {
        struct SetupProvider(FakeProvider);

        #[async_trait]
        impl PaymentProvider for SetupProvider {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn rail(&self) -> PaymentRail {
                self.0.rail()
            }
            fn supported_currencies(&self) -> Vec<String> {
                self.0.supported_currencies()
            }
            async fn create_payment(
                &self,
                request: &PaymentRequest,
            ) -> Result<PaymentResult, PaymentError> {
                self.0.create_payment(request).await
            }
            async fn get_payment_status(
                &self,
                payment_id: &str,
            ) -> Result<PaymentResult, PaymentError> {
                self.0.get_payment_status(payment_id).await
            }
            async fn refund_payment(
                &self,
                payment_id: &str,
            ) -> Result<PaymentResult, PaymentError> {
                self.0.refund_payment(payment_id).await
            }
            fn create_setup_url(&self) -> Option<String> {
                Some("https://example.com/setup".into())
            }
        }

        let manager = PaymentManager::new(ledger_no_free_tier(), None, None, None);
        assert!(manager.setup_url("stripe").is_err());

        manager.register_provider(Arc::new(FakeProvider::named("plain")));
        let err = manager.setup_url("plain").unwrap_err();
        assert!(err.to_string().contains("does not support"));

        manager.register_provider(Arc::new(SetupProvider(FakeProvider::named("setupable"))));
        assert_eq!(manager.setup_url("setupable").unwrap(), "https://example.com/setup");
    }

    #[tokio::test]
    async fn billing_status_shape() {
        let db = Arc::new(KilnDb::open_in_memory().unwrap());
        db.save_payment_method(&kiln_store::PaymentMethodRecord {
            id: "pm_1".into(),
            user_id: "user-1".into(),
            rail: "stripe".into(),
            provider_ref: "cus_123".into(),
            label: "Visa *4242".into(),
            is_default: true,
            created_at: now_ts(),
        })
        .unwrap();

        let manager = PaymentManager::new(ledger_no_free_tier(), None, Some(db), None);
        manager.register_provider(Arc::new(FakeProvider::named("fake")));
        let status = manager.billing_status("user-1");
        assert_eq!(status["user_id"], "user-1");
        assert_eq!(status["default_payment_method"]["label"], "Visa *4242");
        assert_eq!(status["available_rails"][0], "fake");
        assert!(status["fee_policy"].is_object());
        assert!(status["spend_limits"].is_object());

        let empty = manager.billing_status("user-none");
        assert!(empty["default_payment_method"].is_null());
    }
}
