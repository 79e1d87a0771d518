//! Smart job routing — picks the best printer for each job.
//!
//! Scores candidates on material compatibility, availability, reliability,
//! speed and cost. The caller's quality/speed/cost priority sliders shift
//! the category weights.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult};

const MAX_MATERIAL_LEN: usize = 50;
const MIN_PRIORITY: i32 = 1;
const MAX_PRIORITY: i32 = 5;
const MAX_ALTERNATIVES: usize = 4;
const MAX_SCORE: f64 = 100.0;

// Base category weights (sum to 1.0).
const BASE_WEIGHT_MATERIAL: f64 = 0.30;
const BASE_WEIGHT_AVAILABILITY: f64 = 0.25;
const BASE_WEIGHT_RELIABILITY: f64 = 0.20;
const BASE_WEIGHT_SPEED: f64 = 0.15;
const BASE_WEIGHT_COST: f64 = 0.10;

// Weight shift per priority point above or below 3.
const PRIORITY_SHIFT: f64 = 0.03;

/// Criteria for selecting the best printer for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingCriteria {
    pub material: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_print_time_s: Option<f64>,
    /// 1–5; higher boosts material + reliability weight.
    pub quality_priority: i32,
    /// 1–5; higher boosts availability + speed weight.
    pub speed_priority: i32,
    /// 1–5; higher boosts cost weight.
    pub cost_priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl RoutingCriteria {
    pub fn for_material(material: impl Into<String>) -> Self {
        Self {
            material: material.into(),
            file_hash: None,
            estimated_print_time_s: None,
            quality_priority: 3,
            speed_priority: 3,
            cost_priority: 3,
            max_distance_km: None,
            required_capabilities: Vec::new(),
        }
    }
}

/// What the router knows about one candidate printer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub printer_id: String,
    #[serde(default)]
    pub printer_model: String,
    /// Canonical status string (`idle`, `printing`, `busy`, …).
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub supported_materials: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub estimated_wait_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_hour: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_speed_factor: Option<f64>,
}

/// Scored candidate for a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterScore {
    pub printer_id: String,
    pub printer_model: String,
    /// Overall score, 0–100.
    pub score: f64,
    /// Per-category scores keyed by category name.
    pub breakdown: ScoreBreakdown,
    pub available: bool,
    pub estimated_wait_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material_success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Per-category score components, each 0–100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub material: f64,
    pub availability: f64,
    pub reliability: f64,
    pub speed: f64,
    pub cost: f64,
}

/// Result of a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub recommended_printer: PrinterScore,
    /// Up to four next-best candidates, best first.
    pub alternatives: Vec<PrinterScore>,
    pub criteria_used: RoutingCriteria,
    pub routing_time_ms: f64,
}

/// Scores and ranks printers for a given job under weighted criteria.
#[derive(Debug, Default)]
pub struct JobRouter;

impl JobRouter {
    pub fn new() -> Self {
        Self
    }

    /// Score all candidates and return the best match plus alternatives.
    pub fn route_job(
        &self,
        criteria: &RoutingCriteria,
        available_printers: &[PrinterInfo],
    ) -> EngineResult<RoutingResult> {
        validate_criteria(criteria)?;
        validate_printers(available_printers)?;

        let start = Instant::now();

        let candidates: Vec<&PrinterInfo> = available_printers
            .iter()
            .filter(|p| passes_hard_filters(criteria, p))
            .collect();

        if candidates.is_empty() {
            return Err(EngineError::Validation(
                "no printers match the required capabilities and constraints".into(),
            ));
        }

        let mut scores: Vec<PrinterScore> = candidates
            .iter()
            .map(|p| self.score_printer(criteria, p))
            .collect();

        // Descending score; printer_id breaks ties deterministically.
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.printer_id.cmp(&b.printer_id))
        });

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut iter = scores.into_iter();
        let recommended = iter.next().ok_or_else(|| {
            EngineError::Internal("candidate list emptied during scoring".into())
        })?;

        Ok(RoutingResult {
            recommended_printer: recommended,
            alternatives: iter.take(MAX_ALTERNATIVES).collect(),
            criteria_used: criteria.clone(),
            routing_time_ms: elapsed_ms,
        })
    }

    /// Compute the score for a single printer.
    pub fn score_printer(&self, criteria: &RoutingCriteria, info: &PrinterInfo) -> PrinterScore {
        let weights = compute_weights(criteria);

        let breakdown = ScoreBreakdown {
            material: score_material(criteria, info),
            availability: score_availability(info),
            reliability: score_reliability(info),
            speed: score_speed(info),
            cost: score_cost(info),
        };

        let total = weights.material * breakdown.material
            + weights.availability * breakdown.availability
            + weights.reliability * breakdown.reliability
            + weights.speed * breakdown.speed
            + weights.cost * breakdown.cost;
        let total = total.clamp(0.0, MAX_SCORE);

        PrinterScore {
            printer_id: info.printer_id.clone(),
            printer_model: if info.printer_model.is_empty() {
                "unknown".to_string()
            } else {
                info.printer_model.clone()
            },
            score: total,
            breakdown,
            available: info.status.as_deref() == Some("idle") || info.status.is_none(),
            estimated_wait_s: info.estimated_wait_s,
            material_success_rate: info.success_rate,
            distance_km: info.distance_km,
        }
    }
}

struct Weights {
    material: f64,
    availability: f64,
    reliability: f64,
    speed: f64,
    cost: f64,
}

/// Shift base weights by the priority sliders, floor at 0.01 and
/// normalize to sum 1.
fn compute_weights(criteria: &RoutingCriteria) -> Weights {
    let q_delta = f64::from(criteria.quality_priority - 3) * PRIORITY_SHIFT;
    let s_delta = f64::from(criteria.speed_priority - 3) * PRIORITY_SHIFT;
    let c_delta = f64::from(criteria.cost_priority - 3) * PRIORITY_SHIFT;

    let material = (BASE_WEIGHT_MATERIAL + q_delta).max(0.01);
    let reliability = (BASE_WEIGHT_RELIABILITY + q_delta).max(0.01);
    let availability = (BASE_WEIGHT_AVAILABILITY + s_delta).max(0.01);
    let speed = (BASE_WEIGHT_SPEED + s_delta).max(0.01);
    let cost = (BASE_WEIGHT_COST + c_delta).max(0.01);

    let total = material + reliability + availability + speed + cost;
    Weights {
        material: material / total,
        availability: availability / total,
        reliability: reliability / total,
        speed: speed / total,
        cost: cost / total,
    }
}

fn validate_criteria(criteria: &RoutingCriteria) -> EngineResult<()> {
    if criteria.material.is_empty() {
        return Err(EngineError::Validation("material must be a non-empty string".into()));
    }
    if criteria.material.len() > MAX_MATERIAL_LEN {
        return Err(EngineError::Validation(format!(
            "material must be at most {MAX_MATERIAL_LEN} characters"
        )));
    }
    for (name, value) in [
        ("quality_priority", criteria.quality_priority),
        ("speed_priority", criteria.speed_priority),
        ("cost_priority", criteria.cost_priority),
    ] {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
            return Err(EngineError::Validation(format!(
                "{name} must be an integer between {MIN_PRIORITY} and {MAX_PRIORITY}"
            )));
        }
    }
    if let Some(distance) = criteria.max_distance_km {
        if distance <= 0.0 {
            return Err(EngineError::Validation("max_distance_km must be > 0".into()));
        }
    }
    Ok(())
}

fn validate_printers(printers: &[PrinterInfo]) -> EngineResult<()> {
    if printers.is_empty() {
        return Err(EngineError::Validation(
            "available_printers must be a non-empty list".into(),
        ));
    }
    for (idx, printer) in printers.iter().enumerate() {
        if printer.printer_id.is_empty() {
            return Err(EngineError::Validation(format!(
                "printer at index {idx} missing required printer_id"
            )));
        }
    }
    Ok(())
}

fn passes_hard_filters(criteria: &RoutingCriteria, printer: &PrinterInfo) -> bool {
    if !criteria.required_capabilities.is_empty() {
        let has_all = criteria
            .required_capabilities
            .iter()
            .all(|cap| printer.capabilities.iter().any(|c| c == cap));
        if !has_all {
            return false;
        }
    }
    if let Some(max_distance) = criteria.max_distance_km {
        match printer.distance_km {
            Some(distance) if distance <= max_distance => {}
            _ => return false,
        }
    }
    if printer.status.as_deref() == Some("offline") {
        return false;
    }
    true
}

/// Material compatibility blended with empirical success history.
fn score_material(criteria: &RoutingCriteria, printer: &PrinterInfo) -> f64 {
    let base = if printer.supported_materials.is_empty() {
        // No list given: assume a generalist printer.
        70.0
    } else if printer
        .supported_materials
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&criteria.material))
    {
        100.0
    } else {
        return 0.0;
    };

    match printer.success_rate {
        Some(rate) => base * 0.4 + (rate * 100.0) * 0.6,
        None => base,
    }
}

/// Current status and queue depth: idle 100, printing 50, busy 30,
/// error/offline 0; −10 per queued job, floored at 0.
fn score_availability(printer: &PrinterInfo) -> f64 {
    let base = match printer.status.as_deref() {
        None | Some("idle") => 100.0,
        Some("printing") => 50.0,
        Some("busy") => 30.0,
        Some("error") | Some("offline") => return 0.0,
        Some(_) => 40.0,
    };
    (base - f64::from(printer.queue_depth) * 10.0).max(0.0)
}

/// Overall success rate; 50 neutral when unknown.
fn score_reliability(printer: &PrinterInfo) -> f64 {
    match printer.success_rate {
        Some(rate) => rate * 100.0,
        None => 50.0,
    }
}

/// Speed factor minus a wait-time penalty (1 point per minute, cap 50).
fn score_speed(printer: &PrinterInfo) -> f64 {
    let speed_factor = printer.print_speed_factor.unwrap_or(1.0);
    let speed_base = (speed_factor * 50.0).min(100.0);
    let wait_penalty = (printer.estimated_wait_s / 60.0).min(50.0);
    (speed_base - wait_penalty).max(0.0)
}

/// Inverse cost: $1/h = 100, $5/h = 20; 50 neutral when unknown.
fn score_cost(printer: &PrinterInfo) -> f64 {
    match printer.cost_per_hour {
        None => 50.0,
        Some(cost) if cost <= 0.0 => 100.0,
        Some(cost) => (100.0 / cost).clamp(0.0, 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(id: &str) -> PrinterInfo {
        PrinterInfo {
            printer_id: id.to_string(),
            printer_model: "Voron 2.4".to_string(),
            status: Some("idle".to_string()),
            ..PrinterInfo::default()
        }
    }

    #[test]
    fn empty_candidate_list_is_a_validation_error() {
        let router = JobRouter::new();
        let err = router
            .route_job(&RoutingCriteria::for_material("PLA"), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn criteria_validation() {
        let router = JobRouter::new();
        let printers = vec![printer("a")];

        let mut criteria = RoutingCriteria::for_material("");
        assert!(router.route_job(&criteria, &printers).is_err());

        criteria = RoutingCriteria::for_material("x".repeat(51));
        assert!(router.route_job(&criteria, &printers).is_err());

        criteria = RoutingCriteria::for_material("PLA");
        criteria.quality_priority = 0;
        assert!(router.route_job(&criteria, &printers).is_err());

        criteria = RoutingCriteria::for_material("PLA");
        criteria.max_distance_km = Some(-2.0);
        assert!(router.route_job(&criteria, &printers).is_err());

        criteria = RoutingCriteria::for_material("PLA");
        let mut missing_id = printer("");
        missing_id.printer_id.clear();
        assert!(router.route_job(&criteria, &[missing_id]).is_err());
    }

    #[test]
    fn required_capability_filters_candidates() {
        let router = JobRouter::new();
        let mut enclosed = printer("enclosed");
        enclosed.capabilities = vec!["enclosure".to_string()];
        let plain_a = printer("plain-a");
        let plain_b = printer("plain-b");

        let mut criteria = RoutingCriteria::for_material("ABS");
        criteria.required_capabilities = vec!["enclosure".to_string()];

        let result = router
            .route_job(&criteria, &[plain_a, enclosed, plain_b])
            .unwrap();
        assert_eq!(result.recommended_printer.printer_id, "enclosed");
        assert!(result.alternatives.is_empty());
        assert!(result.routing_time_ms >= 0.0);
    }

    #[test]
    fn offline_printers_are_dropped() {
        let router = JobRouter::new();
        let mut offline = printer("offline");
        offline.status = Some("offline".to_string());
        let online = printer("online");

        let result = router
            .route_job(&RoutingCriteria::for_material("PLA"), &[offline, online])
            .unwrap();
        assert_eq!(result.recommended_printer.printer_id, "online");
        assert!(result.alternatives.is_empty());
    }

    #[test]
    fn distance_filter_requires_known_distance() {
        let router = JobRouter::new();
        let mut near = printer("near");
        near.distance_km = Some(5.0);
        let mut far = printer("far");
        far.distance_km = Some(50.0);
        let unknown = printer("unknown");

        let mut criteria = RoutingCriteria::for_material("PLA");
        criteria.max_distance_km = Some(10.0);

        let result = router.route_job(&criteria, &[near, far, unknown]).unwrap();
        assert_eq!(result.recommended_printer.printer_id, "near");
        assert!(result.alternatives.is_empty());
    }

    #[test]
    fn material_scoring_tiers() {
        let criteria = RoutingCriteria::for_material("PLA");

        let mut explicit = printer("a");
        explicit.supported_materials = vec!["PLA".to_string(), "PETG".to_string()];
        assert_eq!(score_material(&criteria, &explicit), 100.0);

        let mut unsupported = printer("b");
        unsupported.supported_materials = vec!["ABS".to_string()];
        assert_eq!(score_material(&criteria, &unsupported), 0.0);

        let no_list = printer("c");
        assert_eq!(score_material(&criteria, &no_list), 70.0);
    }

    #[test]
    fn material_blends_with_success_rate() {
        let criteria = RoutingCriteria::for_material("PLA");
        let mut info = printer("a");
        info.supported_materials = vec!["PLA".to_string()];
        info.success_rate = Some(0.9);
        // 100*0.4 + 90*0.6 = 94
        assert!((score_material(&criteria, &info) - 94.0).abs() < 1e-9);
    }

    #[test]
    fn availability_scoring() {
        let mut info = printer("a");
        assert_eq!(score_availability(&info), 100.0);

        info.status = Some("printing".to_string());
        assert_eq!(score_availability(&info), 50.0);

        info.status = Some("busy".to_string());
        info.queue_depth = 2;
        assert_eq!(score_availability(&info), 10.0);

        info.queue_depth = 5;
        assert_eq!(score_availability(&info), 0.0);

        info.status = Some("error".to_string());
        info.queue_depth = 0;
        assert_eq!(score_availability(&info), 0.0);
    }

    #[test]
    fn reliability_neutral_without_data() {
        let mut info = printer("a");
        assert_eq!(score_reliability(&info), 50.0);
        info.success_rate = Some(0.97);
        assert!((score_reliability(&info) - 97.0).abs() < 1e-9);
    }

    #[test]
    fn speed_penalizes_wait() {
        let mut info = printer("a");
        info.print_speed_factor = Some(2.0);
        assert_eq!(score_speed(&info), 100.0);

        info.estimated_wait_s = 600.0; // 10 minutes → −10
        assert_eq!(score_speed(&info), 90.0);

        info.estimated_wait_s = 10_000.0; // cap at −50
        assert_eq!(score_speed(&info), 50.0);

        info.print_speed_factor = Some(0.5);
        info.estimated_wait_s = 0.0;
        assert_eq!(score_speed(&info), 25.0);
    }

    #[test]
    fn cost_scoring() {
        let mut info = printer("a");
        assert_eq!(score_cost(&info), 50.0);
        info.cost_per_hour = Some(1.0);
        assert_eq!(score_cost(&info), 100.0);
        info.cost_per_hour = Some(5.0);
        assert_eq!(score_cost(&info), 20.0);
        info.cost_per_hour = Some(0.0);
        assert_eq!(score_cost(&info), 100.0);
    }

    #[test]
    fn weights_shift_with_priorities_and_stay_normalized() {
        let mut criteria = RoutingCriteria::for_material("PLA");
        criteria.quality_priority = 5;
        criteria.speed_priority = 1;
        criteria.cost_priority = 3;

        let weights = compute_weights(&criteria);
        let sum = weights.material
            + weights.availability
            + weights.reliability
            + weights.speed
            + weights.cost;
        assert!((sum - 1.0).abs() < 1e-9);
        // Quality boost raises material above its base share.
        assert!(weights.material > 0.30);
        // Speed de-prioritised below its base share.
        assert!(weights.speed < 0.15);
    }

    #[test]
    fn ranking_is_deterministic_on_ties() {
        let router = JobRouter::new();
        let result = router
            .route_job(
                &RoutingCriteria::for_material("PLA"),
                &[printer("beta"), printer("alpha"), printer("gamma")],
            )
            .unwrap();
        assert_eq!(result.recommended_printer.printer_id, "alpha");
        let alt_ids: Vec<&str> = result
            .alternatives
            .iter()
            .map(|s| s.printer_id.as_str())
            .collect();
        assert_eq!(alt_ids, vec!["beta", "gamma"]);
    }

    #[test]
    fn at_most_four_alternatives() {
        let router = JobRouter::new();
        let printers: Vec<PrinterInfo> = (0..8).map(|i| printer(&format!("p{i}"))).collect();
        let result = router
            .route_job(&RoutingCriteria::for_material("PLA"), &printers)
            .unwrap();
        assert_eq!(result.alternatives.len(), 4);
    }

    #[test]
    fn idle_printer_outranks_busy_one() {
        let router = JobRouter::new();
        let idle = printer("idle-one");
        let mut busy = printer("busy-one");
        busy.status = Some("printing".to_string());
        busy.queue_depth = 3;

        let result = router
            .route_job(&RoutingCriteria::for_material("PLA"), &[busy, idle])
            .unwrap();
        assert_eq!(result.recommended_printer.printer_id, "idle-one");
    }
}
