//! Operator reputation: profiles, tier computation and feedback
//! aggregation for the print network.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::now_ts;

const MAX_ID_LEN: usize = 64;
const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_COMMENT_LEN: usize = 500;

// (success rate, minimum orders) per tier.
const TIER_PLATINUM: (f64, u64) = (0.98, 100);
const TIER_GOLD: (f64, u64) = (0.95, 50);
const TIER_SILVER: (f64, u64) = (0.90, 20);
const TIER_BRONZE: (f64, u64) = (0.80, 5);

/// Errors raised by the reputation engine.
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("{0}")]
    Validation(String),

    #[error("operator {0:?} not found")]
    OperatorNotFound(String),

    #[error("operator {0:?} already registered")]
    DuplicateOperator(String),
}

/// A print operator's profile and aggregated performance metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorProfile {
    pub operator_id: String,
    pub display_name: String,
    pub registered_at: f64,
    pub verified: bool,
    pub printer_count: u32,
    pub total_orders: u64,
    pub successful_orders: u64,
    pub failed_orders: u64,
    pub avg_print_time_s: f64,
    /// Rolling average quality score (0–5); 0 until feedback arrives.
    pub avg_quality_score: f64,
    pub materials_supported: Vec<String>,
    pub last_active_at: f64,
}

impl OperatorProfile {
    fn new(operator_id: &str, display_name: &str) -> Self {
        let now = now_ts();
        Self {
            operator_id: operator_id.to_string(),
            display_name: display_name.to_string(),
            registered_at: now,
            verified: false,
            printer_count: 0,
            total_orders: 0,
            successful_orders: 0,
            failed_orders: 0,
            avg_print_time_s: 0.0,
            avg_quality_score: 0.0,
            materials_supported: Vec::new(),
            last_active_at: now,
        }
    }

    /// Fraction of successful orders; 0.0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.total_orders == 0 {
            return 0.0;
        }
        self.successful_orders as f64 / self.total_orders as f64
    }

    /// Tier ladder: platinum ≥98%/100 orders, gold ≥95%/50,
    /// silver ≥90%/20, bronze ≥80%/5, else new.
    pub fn reliability_tier(&self) -> &'static str {
        let rate = self.success_rate();
        let total = self.total_orders;
        if rate >= TIER_PLATINUM.0 && total >= TIER_PLATINUM.1 {
            "platinum"
        } else if rate >= TIER_GOLD.0 && total >= TIER_GOLD.1 {
            "gold"
        } else if rate >= TIER_SILVER.0 && total >= TIER_SILVER.1 {
            "silver"
        } else if rate >= TIER_BRONZE.0 && total >= TIER_BRONZE.1 {
            "bronze"
        } else {
            "new"
        }
    }
}

/// Customer feedback for a completed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFeedback {
    pub order_id: String,
    pub operator_id: String,
    pub customer_id: String,
    /// 1–5.
    pub quality_score: u8,
    pub on_time: bool,
    /// 1–5.
    pub communication_score: u8,
    pub would_recommend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: f64,
}

fn validate_id(value: &str, field: &str) -> Result<(), ReputationError> {
    if value.is_empty() {
        return Err(ReputationError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ReputationError::Validation(format!(
            "{field} must be at most {MAX_ID_LEN} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(ReputationError::Validation(format!(
            "{field} may only contain alphanumerics, dash, underscore and dot"
        )));
    }
    Ok(())
}

fn validate_feedback(feedback: &OrderFeedback) -> Result<(), ReputationError> {
    validate_id(&feedback.order_id, "order_id")?;
    validate_id(&feedback.operator_id, "operator_id")?;
    validate_id(&feedback.customer_id, "customer_id")?;
    for (name, score) in [
        ("quality_score", feedback.quality_score),
        ("communication_score", feedback.communication_score),
    ] {
        if !(1..=5).contains(&score) {
            return Err(ReputationError::Validation(format!(
                "{name} must be between 1 and 5"
            )));
        }
    }
    if let Some(comment) = &feedback.comment {
        if comment.len() > MAX_COMMENT_LEN {
            return Err(ReputationError::Validation(format!(
                "comment must be at most {MAX_COMMENT_LEN} characters"
            )));
        }
    }
    Ok(())
}

#[derive(Default)]
struct EngineState {
    operators: HashMap<String, OperatorProfile>,
    feedback: Vec<OrderFeedback>,
}

/// Thread-safe operator reputation engine.
pub struct ReputationEngine {
    state: Mutex<EngineState>,
}

impl ReputationEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Register a new operator.
    pub fn register_operator(
        &self,
        operator_id: &str,
        display_name: &str,
    ) -> Result<OperatorProfile, ReputationError> {
        validate_id(operator_id, "operator_id")?;
        if display_name.is_empty() || display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(ReputationError::Validation(
                "display_name must be 1-100 characters".into(),
            ));
        }

        let mut state = self.state.lock();
        if state.operators.contains_key(operator_id) {
            return Err(ReputationError::DuplicateOperator(operator_id.to_string()));
        }
        let profile = OperatorProfile::new(operator_id, display_name);
        state.operators.insert(operator_id.to_string(), profile.clone());
        tracing::info!(operator_id, display_name, "registered operator");
        Ok(profile)
    }

    pub fn get_operator(&self, operator_id: &str) -> Option<OperatorProfile> {
        self.state.lock().operators.get(operator_id).cloned()
    }

    /// Record a completed (or failed) order, updating rolling averages.
    pub fn record_order_completion(
        &self,
        operator_id: &str,
        success: bool,
        print_time_s: f64,
    ) -> Result<(), ReputationError> {
        if print_time_s < 0.0 {
            return Err(ReputationError::Validation("print_time_s must be >= 0".into()));
        }
        let mut state = self.state.lock();
        let profile = state
            .operators
            .get_mut(operator_id)
            .ok_or_else(|| ReputationError::OperatorNotFound(operator_id.to_string()))?;

        profile.total_orders += 1;
        if success {
            profile.successful_orders += 1;
        } else {
            profile.failed_orders += 1;
        }
        let prev_total = profile.total_orders - 1;
        profile.avg_print_time_s = if prev_total == 0 {
            print_time_s
        } else {
            (profile.avg_print_time_s * prev_total as f64 + print_time_s)
                / profile.total_orders as f64
        };
        profile.last_active_at = now_ts();
        Ok(())
    }

    /// Submit customer feedback, updating the operator's rolling quality
    /// average.
    pub fn submit_feedback(&self, feedback: OrderFeedback) -> Result<(), ReputationError> {
        validate_feedback(&feedback)?;
        let mut state = self.state.lock();
        if !state.operators.contains_key(&feedback.operator_id) {
            return Err(ReputationError::OperatorNotFound(feedback.operator_id.clone()));
        }
        state.feedback.push(feedback.clone());

        let (total, count) = state
            .feedback
            .iter()
            .filter(|f| f.operator_id == feedback.operator_id)
            .fold((0u64, 0u64), |(sum, n), f| (sum + u64::from(f.quality_score), n + 1));
        if let Some(profile) = state.operators.get_mut(&feedback.operator_id) {
            profile.avg_quality_score = total as f64 / count as f64;
            profile.last_active_at = now_ts();
        }
        Ok(())
    }

    /// Admin action: mark an operator verified.
    pub fn verify_operator(&self, operator_id: &str) -> Result<(), ReputationError> {
        let mut state = self.state.lock();
        let profile = state
            .operators
            .get_mut(operator_id)
            .ok_or_else(|| ReputationError::OperatorNotFound(operator_id.to_string()))?;
        profile.verified = true;
        Ok(())
    }

    /// Top operators by (success rate, volume), best first.
    pub fn leaderboard(&self, limit: usize) -> Vec<OperatorProfile> {
        let state = self.state.lock();
        let mut operators: Vec<OperatorProfile> = state.operators.values().cloned().collect();
        operators.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.total_orders.cmp(&a.total_orders))
                .then_with(|| a.operator_id.cmp(&b.operator_id))
        });
        operators.truncate(limit);
        operators
    }

    /// All feedback for one operator, newest first.
    pub fn operator_feedback(&self, operator_id: &str) -> Vec<OrderFeedback> {
        let state = self.state.lock();
        let mut out: Vec<OrderFeedback> = state
            .feedback
            .iter()
            .filter(|f| f.operator_id == operator_id)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

impl Default for ReputationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(operator_id: &str, quality: u8) -> OrderFeedback {
        OrderFeedback {
            order_id: "order-1".into(),
            operator_id: operator_id.into(),
            customer_id: "customer-1".into(),
            quality_score: quality,
            on_time: true,
            communication_score: 5,
            would_recommend: true,
            comment: None,
            created_at: now_ts(),
        }
    }

    #[test]
    fn register_and_fetch() {
        let engine = ReputationEngine::new();
        let profile = engine.register_operator("maker-1", "Maker One").unwrap();
        assert_eq!(profile.reliability_tier(), "new");
        assert!(engine.get_operator("maker-1").is_some());
        assert!(engine.get_operator("ghost").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();
        assert!(matches!(
            engine.register_operator("maker-1", "Again"),
            Err(ReputationError::DuplicateOperator(_))
        ));
    }

    #[test]
    fn id_validation() {
        let engine = ReputationEngine::new();
        assert!(engine.register_operator("", "Name").is_err());
        assert!(engine.register_operator("bad id!", "Name").is_err());
        assert!(engine
            .register_operator(&"x".repeat(65), "Name")
            .is_err());
    }

    #[test]
    fn order_tracking_updates_averages() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();
        engine.record_order_completion("maker-1", true, 100.0).unwrap();
        engine.record_order_completion("maker-1", true, 300.0).unwrap();
        engine.record_order_completion("maker-1", false, 200.0).unwrap();

        let profile = engine.get_operator("maker-1").unwrap();
        assert_eq!(profile.total_orders, 3);
        assert_eq!(profile.successful_orders, 2);
        assert_eq!(profile.failed_orders, 1);
        assert!((profile.avg_print_time_s - 200.0).abs() < 1e-9);
        assert!((profile.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn tier_ladder_thresholds() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();

        // 5 orders, all successful → bronze (volume gate).
        for _ in 0..5 {
            engine.record_order_completion("maker-1", true, 60.0).unwrap();
        }
        assert_eq!(engine.get_operator("maker-1").unwrap().reliability_tier(), "bronze");

        // 20 total at 100% → silver; 50 → gold; 100 → platinum.
        for _ in 0..15 {
            engine.record_order_completion("maker-1", true, 60.0).unwrap();
        }
        assert_eq!(engine.get_operator("maker-1").unwrap().reliability_tier(), "silver");
        for _ in 0..30 {
            engine.record_order_completion("maker-1", true, 60.0).unwrap();
        }
        assert_eq!(engine.get_operator("maker-1").unwrap().reliability_tier(), "gold");
        for _ in 0..50 {
            engine.record_order_completion("maker-1", true, 60.0).unwrap();
        }
        assert_eq!(engine.get_operator("maker-1").unwrap().reliability_tier(), "platinum");
    }

    #[test]
    fn failures_demote_tier() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();
        // 10 orders with 7 successes = 70% → below bronze's 80%.
        for i in 0..10 {
            engine.record_order_completion("maker-1", i < 7, 60.0).unwrap();
        }
        assert_eq!(engine.get_operator("maker-1").unwrap().reliability_tier(), "new");
    }

    #[test]
    fn feedback_aggregates_quality() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();
        engine.submit_feedback(feedback("maker-1", 5)).unwrap();
        engine.submit_feedback(feedback("maker-1", 3)).unwrap();

        let profile = engine.get_operator("maker-1").unwrap();
        assert!((profile.avg_quality_score - 4.0).abs() < 1e-9);
        assert_eq!(engine.operator_feedback("maker-1").len(), 2);
    }

    #[test]
    fn feedback_validation() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();

        let mut bad_score = feedback("maker-1", 0);
        bad_score.quality_score = 0;
        assert!(engine.submit_feedback(bad_score).is_err());

        let mut long_comment = feedback("maker-1", 4);
        long_comment.comment = Some("x".repeat(501));
        assert!(engine.submit_feedback(long_comment).is_err());

        assert!(matches!(
            engine.submit_feedback(feedback("ghost", 4)),
            Err(ReputationError::OperatorNotFound(_))
        ));
    }

    #[test]
    fn verification_flag() {
        let engine = ReputationEngine::new();
        engine.register_operator("maker-1", "Maker One").unwrap();
        assert!(!engine.get_operator("maker-1").unwrap().verified);
        engine.verify_operator("maker-1").unwrap();
        assert!(engine.get_operator("maker-1").unwrap().verified);
    }

    #[test]
    fn leaderboard_orders_by_rate_then_volume() {
        let engine = ReputationEngine::new();
        engine.register_operator("steady", "Steady").unwrap();
        engine.register_operator("flaky", "Flaky").unwrap();
        engine.register_operator("busy", "Busy").unwrap();

        for _ in 0..10 {
            engine.record_order_completion("steady", true, 60.0).unwrap();
        }
        for i in 0..10 {
            engine.record_order_completion("flaky", i % 2 == 0, 60.0).unwrap();
        }
        for _ in 0..20 {
            engine.record_order_completion("busy", true, 60.0).unwrap();
        }

        let board = engine.leaderboard(10);
        let ids: Vec<&str> = board.iter().map(|p| p.operator_id.as_str()).collect();
        assert_eq!(ids, vec!["busy", "steady", "flaky"]);

        assert_eq!(engine.leaderboard(1).len(), 1);
    }
}
