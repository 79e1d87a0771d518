//! Fee policy, free tier, spend limits and the idempotent charge ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kiln_store::{ChargeRecord, KilnDb, MonthlySummary};

use crate::now_ts;

/// Network fee policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePolicy {
    pub network_fee_percent: f64,
    pub min_fee: f64,
    pub max_fee: f64,
    /// Jobs per calendar month that incur no fee.
    pub free_tier_jobs: u32,
    pub currency: String,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            network_fee_percent: 5.0,
            min_fee: 0.25,
            max_fee: 200.0,
            free_tier_jobs: 5,
            currency: "USD".into(),
        }
    }
}

/// Spend ceilings applied before any payment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendLimits {
    pub max_per_order: f64,
    pub max_per_day: f64,
    pub max_per_month: f64,
}

impl Default for SpendLimits {
    fn default() -> Self {
        Self {
            max_per_order: 500.0,
            max_per_day: 1000.0,
            max_per_month: 2000.0,
        }
    }
}

/// Outcome of a fee calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeCalculation {
    pub job_cost: f64,
    pub fee_amount: f64,
    /// Effective percentage after clamping.
    pub fee_percent: f64,
    pub total_cost: f64,
    pub currency: String,
    pub waived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiver_reason: Option<String>,
}

/// One recorded charge; `job_id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeEntry {
    pub job_id: String,
    pub fee: FeeCalculation,
    pub payment_id: Option<String>,
    pub payment_rail: Option<String>,
    pub payment_status: String,
    pub user_email: Option<String>,
    pub timestamp: f64,
}

#[derive(Default)]
struct LedgerState {
    charges: Vec<ChargeEntry>,
    by_job_id: HashMap<String, usize>,
}

/// Thread-safe billing ledger with an optional durable mirror.
///
/// The free-tier counter counts every charge recorded in the current UTC
/// calendar month, waived charges included — that is what makes
/// "job N of M free" terminate at M.
pub struct BillingLedger {
    policy: FeePolicy,
    limits: SpendLimits,
    state: Mutex<LedgerState>,
    db: Option<Arc<KilnDb>>,
}

impl BillingLedger {
    pub fn new(policy: FeePolicy) -> Self {
        Self {
            policy,
            limits: SpendLimits::default(),
            state: Mutex::new(LedgerState::default()),
            db: None,
        }
    }

    pub fn with_limits(policy: FeePolicy, limits: SpendLimits) -> Self {
        Self {
            policy,
            limits,
            state: Mutex::new(LedgerState::default()),
            db: None,
        }
    }

    /// Attach a durable mirror; `record_charge` then also writes a row via
    /// `INSERT OR IGNORE` on the unique job_id key.
    pub fn with_store(policy: FeePolicy, limits: SpendLimits, db: Arc<KilnDb>) -> Self {
        Self {
            policy,
            limits,
            state: Mutex::new(LedgerState::default()),
            db: Some(db),
        }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    pub fn limits(&self) -> &SpendLimits {
        &self.limits
    }

    /// Compute the fee for a job cost.
    ///
    /// Zero or negative cost yields a zero fee that is *not* waived; the
    /// free tier waives the first N charges of the calendar month.
    pub fn calculate_fee(&self, job_cost: f64, currency: Option<&str>) -> FeeCalculation {
        let currency = currency.unwrap_or(&self.policy.currency).to_string();

        if job_cost <= 0.0 {
            return FeeCalculation {
                job_cost,
                fee_amount: 0.0,
                fee_percent: 0.0,
                total_cost: job_cost,
                currency,
                waived: false,
                waiver_reason: None,
            };
        }

        let used = self.network_jobs_this_month();
        if used < self.policy.free_tier_jobs as usize {
            return FeeCalculation {
                job_cost,
                fee_amount: 0.0,
                fee_percent: 0.0,
                total_cost: job_cost,
                currency,
                waived: true,
                waiver_reason: Some(format!(
                    "Free tier: job {} of {} free this month",
                    used + 1,
                    self.policy.free_tier_jobs
                )),
            };
        }

        let raw = job_cost * self.policy.network_fee_percent / 100.0;
        let fee_amount = raw.clamp(self.policy.min_fee, self.policy.max_fee);
        FeeCalculation {
            job_cost,
            fee_amount,
            fee_percent: fee_amount / job_cost * 100.0,
            total_cost: job_cost + fee_amount,
            currency,
            waived: false,
            waiver_reason: None,
        }
    }

    /// Persist one charge. Replaying the same job_id is a no-op that
    /// returns the existing entry — this is the mechanism the payment
    /// retry protocol relies on.
    pub fn record_charge(
        &self,
        job_id: &str,
        fee: &FeeCalculation,
        payment_id: Option<&str>,
        payment_rail: Option<&str>,
        payment_status: Option<&str>,
    ) -> ChargeEntry {
        let mut state = self.state.lock();
        if let Some(&idx) = state.by_job_id.get(job_id) {
            return state.charges[idx].clone();
        }

        let status = payment_status
            .map(str::to_string)
            .unwrap_or_else(|| if fee.waived { "waived".into() } else { "recorded".into() });
        let entry = ChargeEntry {
            job_id: job_id.to_string(),
            fee: fee.clone(),
            payment_id: payment_id.map(str::to_string),
            payment_rail: payment_rail.map(str::to_string),
            payment_status: status,
            user_email: None,
            timestamp: now_ts(),
        };
        let idx = state.charges.len();
        state.by_job_id.insert(job_id.to_string(), idx);
        state.charges.push(entry.clone());
        drop(state);

        if let Some(db) = &self.db {
            let record = ChargeRecord {
                job_id: entry.job_id.clone(),
                fee_amount: entry.fee.fee_amount,
                fee_percent: entry.fee.fee_percent,
                job_cost: entry.fee.job_cost,
                currency: entry.fee.currency.clone(),
                waived: entry.fee.waived,
                waiver_reason: entry.fee.waiver_reason.clone(),
                payment_id: entry.payment_id.clone(),
                payment_rail: entry.payment_rail.clone(),
                payment_status: entry.payment_status.clone(),
                user_email: None,
                timestamp: entry.timestamp,
            };
            if let Err(err) = db.save_billing_charge(&record) {
                tracing::warn!(job_id, error = %err, "failed to mirror charge to store");
            }
        }
        entry
    }

    /// Update the payment fields of an existing charge (e.g. after a
    /// capture completes).
    pub fn update_charge_payment(
        &self,
        job_id: &str,
        payment_id: Option<&str>,
        payment_rail: Option<&str>,
        payment_status: &str,
    ) {
        let mut state = self.state.lock();
        if let Some(&idx) = state.by_job_id.get(job_id) {
            let entry = &mut state.charges[idx];
            if payment_id.is_some() {
                entry.payment_id = payment_id.map(str::to_string);
            }
            if payment_rail.is_some() {
                entry.payment_rail = payment_rail.map(str::to_string);
            }
            entry.payment_status = payment_status.to_string();
        }
    }

    /// Tag a charge with the user who placed it, for per-user free-tier
    /// tracking.
    pub fn tag_charge_user(&self, job_id: &str, user_email: &str) {
        {
            let mut state = self.state.lock();
            if let Some(&idx) = state.by_job_id.get(job_id) {
                state.charges[idx].user_email = Some(user_email.to_string());
            }
        }
        if let Some(db) = &self.db {
            if let Err(err) = db.set_charge_user(job_id, user_email) {
                tracing::debug!(job_id, error = %err, "failed to tag charge user in store");
            }
        }
    }

    /// The charge for a job, if one exists.
    pub fn get_job_charge(&self, job_id: &str) -> Option<ChargeEntry> {
        let state = self.state.lock();
        state.by_job_id.get(job_id).map(|&idx| state.charges[idx].clone())
    }

    /// Recent charges, newest first.
    pub fn list_charges(&self, limit: usize) -> Vec<ChargeEntry> {
        let state = self.state.lock();
        state.charges.iter().rev().take(limit).cloned().collect()
    }

    fn in_current_month(ts: f64) -> bool {
        let now = Utc::now();
        match Utc.timestamp_opt(ts as i64, 0).single() {
            Some(then) => then.year() == now.year() && then.month() == now.month(),
            None => false,
        }
    }

    /// Charges recorded this calendar month, waived included.
    pub fn network_jobs_this_month(&self) -> usize {
        self.state
            .lock()
            .charges
            .iter()
            .filter(|c| Self::in_current_month(c.timestamp))
            .count()
    }

    /// Per-user count of charges this calendar month.
    pub fn network_jobs_this_month_for_user(&self, user_email: &str) -> usize {
        self.state
            .lock()
            .charges
            .iter()
            .filter(|c| {
                c.user_email.as_deref() == Some(user_email)
                    && Self::in_current_month(c.timestamp)
            })
            .count()
    }

    /// Check a proposed fee against the configured spend limits.
    pub fn check_spend_limits(&self, proposed_fee: f64) -> (bool, Option<String>) {
        if proposed_fee > self.limits.max_per_order {
            return (
                false,
                Some(format!(
                    "fee {proposed_fee:.2} exceeds the per-order limit of {:.2}",
                    self.limits.max_per_order
                )),
            );
        }

        let now = now_ts();
        let (day_total, month_total) = {
            let state = self.state.lock();
            let day: f64 = state
                .charges
                .iter()
                .filter(|c| c.timestamp >= now - 86_400.0)
                .map(|c| c.fee.fee_amount)
                .sum();
            let month: f64 = state
                .charges
                .iter()
                .filter(|c| Self::in_current_month(c.timestamp))
                .map(|c| c.fee.fee_amount)
                .sum();
            (day, month)
        };

        if day_total + proposed_fee > self.limits.max_per_day {
            return (
                false,
                Some(format!(
                    "daily cap exceeded: {:.2} spent in 24h, limit {:.2}",
                    day_total, self.limits.max_per_day
                )),
            );
        }
        if month_total + proposed_fee > self.limits.max_per_month {
            return (
                false,
                Some(format!(
                    "monthly cap exceeded: {:.2} spent this month, limit {:.2}",
                    month_total, self.limits.max_per_month
                )),
            );
        }
        (true, None)
    }

    /// Aggregate fees for one UTC calendar month (current when `None`).
    pub fn monthly_revenue(&self, year: Option<i32>, month: Option<u32>) -> MonthlySummary {
        let state = self.state.lock();
        let in_month = |ts: f64| -> bool {
            match (year, month) {
                (Some(y), Some(m)) => match Utc.timestamp_opt(ts as i64, 0).single() {
                    Some(then) => then.year() == y && then.month() == m,
                    None => false,
                },
                _ => Self::in_current_month(ts),
            }
        };

        let mut total = 0.0;
        let mut count = 0;
        let mut waived = 0;
        for charge in state.charges.iter().filter(|c| in_month(c.timestamp)) {
            total += charge.fee.fee_amount;
            count += 1;
            if charge.fee.waived {
                waived += 1;
            }
        }
        MonthlySummary {
            total_fees: (total * 100.0).round() / 100.0,
            job_count: count,
            waived_count: waived,
        }
    }
}

impl Default for BillingLedger {
    fn default() -> Self {
        Self::new(FeePolicy::default())
    }
}
