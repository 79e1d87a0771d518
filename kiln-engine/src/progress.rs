//! Print progress estimation for FDM jobs.
//!
//! Models wall-clock time as four phases (preparing, printing, cooling,
//! post-processing) and calibrates against a rolling window of
//! estimated-vs-actual durations per printer model.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::now_ts;

/// Manufacturing phase within an FDM print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintPhase {
    /// Bed heating, nozzle heating, auto-leveling, homing.
    Preparing,
    /// Layer-by-layer deposition — the main phase.
    Printing,
    /// Part cooling on the bed, nozzle cooldown.
    Cooling,
    /// Part removal, bed cleanup.
    PostProcessing,
    Complete,
}

const FDM_PHASES: [PrintPhase; 5] = [
    PrintPhase::Preparing,
    PrintPhase::Printing,
    PrintPhase::Cooling,
    PrintPhase::PostProcessing,
    PrintPhase::Complete,
];

// Default phase-weight fractions, used when no layer/speed data exists.
const WEIGHT_PREPARING: f64 = 0.04;
const WEIGHT_PRINTING: f64 = 0.92;
const WEIGHT_COOLING: f64 = 0.025;
const WEIGHT_POST_PROCESSING: f64 = 0.015;

// FDM timing defaults (seconds).
const FDM_PREPARE_S: f64 = 100.0;
const FDM_PER_LAYER_OVERHEAD_S: f64 = 1.5;
const FDM_COOL_S: f64 = 90.0;
const FDM_POST_PROCESS_S: f64 = 60.0;

// First layer runs at roughly half speed.
const FIRST_LAYER_SPEED_FACTOR: f64 = 0.5;
// Blend of perimeter and infill speeds versus the nominal.
const EFFECTIVE_SPEED_FACTOR: f64 = 0.75;

const HISTORY_WINDOW: usize = 20;

/// Estimated timing for a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEstimate {
    pub phase: PrintPhase,
    pub estimated_duration_s: f64,
    pub elapsed_s: f64,
    /// 0.0 – 100.0
    pub progress_pct: f64,
}

/// Full progress estimate for an active FDM print job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintProgressEstimate {
    pub job_id: String,
    pub printer_type: String,
    pub current_phase: PrintPhase,
    pub phases: Vec<PhaseEstimate>,
    pub total_estimated_s: f64,
    pub total_elapsed_s: f64,
    pub overall_progress_pct: f64,
    /// Unix timestamp of expected completion.
    pub estimated_completion: f64,
    /// 0.0 – 1.0; lower early in a job, capped by history depth.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_layer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layers: Option<u32>,
}

/// Inputs for a layer-based estimate.
#[derive(Debug, Clone)]
pub struct PrintParameters {
    pub layer_count: u32,
    pub layer_height_mm: f64,
    pub filament_length_mm: f64,
    pub print_speed_mm_s: f64,
    pub current_layer: u32,
    pub printer_model: String,
    pub job_id: Option<String>,
}

#[derive(Default)]
struct EstimatorState {
    /// Per printer model: rolling `(estimated, actual)` pairs.
    history: HashMap<String, Vec<(f64, f64)>>,
    /// Per job id: total estimated duration, for later calibration.
    estimates: HashMap<String, f64>,
}

/// Estimates print progress and time-remaining for FDM jobs.
pub struct ProgressEstimator {
    state: Mutex<EstimatorState>,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EstimatorState::default()),
        }
    }

    /// Estimate progress from layer/speed/filament data.
    pub fn estimate_print(&self, params: &PrintParameters) -> PrintProgressEstimate {
        let job_id = params
            .job_id
            .clone()
            .unwrap_or_else(|| format!("fdm-{}", uuid::Uuid::new_v4().simple()));

        let printing_s = estimate_printing_duration(
            params.layer_count,
            params.filament_length_mm,
            params.print_speed_mm_s,
        );

        let durations = [
            (PrintPhase::Preparing, FDM_PREPARE_S),
            (PrintPhase::Printing, printing_s),
            (PrintPhase::Cooling, FDM_COOL_S),
            (PrintPhase::PostProcessing, FDM_POST_PROCESS_S),
            (PrintPhase::Complete, 0.0),
        ];

        // Once printing has started, preparation is done; progress is
        // proportional to the layer fraction.
        let elapsed = if params.current_layer > 0 && params.layer_count > 0 {
            let layer_fraction =
                (f64::from(params.current_layer) / f64::from(params.layer_count)).min(1.0);
            FDM_PREPARE_S + printing_s * layer_fraction
        } else {
            0.0
        };

        let history_key = params.printer_model.to_lowercase();
        let correction = self.correction_factor(&history_key);
        let total_estimated: f64 =
            durations.iter().map(|(_, d)| d).sum::<f64>() * correction;

        let (phases, current_phase, overall_pct) = build_phases(&durations, elapsed);
        let confidence = self.compute_confidence(elapsed, total_estimated, &history_key);

        let remaining = (total_estimated - elapsed).max(0.0);
        self.state.lock().estimates.insert(job_id.clone(), total_estimated);

        PrintProgressEstimate {
            job_id,
            printer_type: "fdm".into(),
            current_phase,
            phases,
            total_estimated_s: round2(total_estimated),
            total_elapsed_s: round2(elapsed),
            overall_progress_pct: overall_pct,
            estimated_completion: round2(now_ts() + remaining),
            confidence: round4(confidence),
            current_layer: Some(params.current_layer),
            total_layers: Some(params.layer_count),
        }
    }

    /// Extrapolate completion from a raw progress percentage and elapsed
    /// time. Useful when the printer only reports overall progress.
    ///
    /// The reported percentage overrides the computed overall value so the
    /// UI stays monotonic.
    pub fn estimate_from_progress(
        &self,
        progress_pct: f64,
        elapsed_s: f64,
        printer_model: &str,
        job_id: Option<String>,
    ) -> PrintProgressEstimate {
        let job_id =
            job_id.unwrap_or_else(|| format!("fdm-{}", uuid::Uuid::new_v4().simple()));

        let progress_clamped = progress_pct.clamp(0.0, 100.0);
        let mut total_estimated = if progress_clamped > 0.0 {
            (elapsed_s / progress_clamped) * 100.0
        } else {
            0.0
        };

        let durations = [
            (PrintPhase::Preparing, total_estimated * WEIGHT_PREPARING),
            (PrintPhase::Printing, total_estimated * WEIGHT_PRINTING),
            (PrintPhase::Cooling, total_estimated * WEIGHT_COOLING),
            (PrintPhase::PostProcessing, total_estimated * WEIGHT_POST_PROCESSING),
            (PrintPhase::Complete, 0.0),
        ];

        let history_key = printer_model.to_lowercase();
        total_estimated *= self.correction_factor(&history_key);

        let (phases, current_phase, computed_pct) = build_phases(&durations, elapsed_s);
        let overall_pct = if progress_clamped > 0.0 {
            round2(progress_clamped)
        } else {
            computed_pct
        };

        let confidence = self.compute_confidence(elapsed_s, total_estimated, &history_key);
        let remaining = (total_estimated - elapsed_s).max(0.0);
        self.state.lock().estimates.insert(job_id.clone(), total_estimated);

        PrintProgressEstimate {
            job_id,
            printer_type: "fdm".into(),
            current_phase,
            phases,
            total_estimated_s: round2(total_estimated),
            total_elapsed_s: round2(elapsed_s),
            overall_progress_pct: overall_pct,
            estimated_completion: round2(now_ts() + remaining),
            confidence: round4(confidence),
            current_layer: None,
            total_layers: None,
        }
    }

    /// Record the actual duration of a completed job to calibrate future
    /// estimates.
    pub fn record_actual(&self, job_id: &str, actual_duration_s: f64, printer_model: &str) {
        let mut state = self.state.lock();
        let estimated = state
            .estimates
            .get(job_id)
            .copied()
            .unwrap_or(actual_duration_s);
        let history = state
            .history
            .entry(printer_model.to_lowercase())
            .or_default();
        history.push((estimated, actual_duration_s));
        let overflow = history.len().saturating_sub(HISTORY_WINDOW);
        if overflow > 0 {
            history.drain(..overflow);
        }
    }

    /// Average estimation accuracy (0.0 – 1.0) for a printer model;
    /// 1.0 when no history exists.
    pub fn accuracy(&self, printer_model: &str) -> f64 {
        let state = self.state.lock();
        let Some(history) = state.history.get(&printer_model.to_lowercase()) else {
            return 1.0;
        };
        let ratios: Vec<f64> = history
            .iter()
            .filter(|(_, actual)| *actual != 0.0)
            .map(|(est, actual)| est.min(*actual) / est.max(*actual))
            .collect();
        if ratios.is_empty() {
            return 1.0;
        }
        round4(ratios.iter().sum::<f64>() / ratios.len() as f64)
    }

    /// Number of recorded actuals for a printer model.
    pub fn history_count(&self, printer_model: &str) -> usize {
        self.state
            .lock()
            .history
            .get(&printer_model.to_lowercase())
            .map_or(0, Vec::len)
    }

    /// Mean actual/estimated ratio for a model; multiplies fresh estimates.
    fn correction_factor(&self, history_key: &str) -> f64 {
        let state = self.state.lock();
        let Some(history) = state.history.get(history_key) else {
            return 1.0;
        };
        let ratios: Vec<f64> = history
            .iter()
            .filter(|(est, _)| *est > 0.0)
            .map(|(est, actual)| actual / est)
            .collect();
        if ratios.is_empty() {
            return 1.0;
        }
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }

    /// Confidence rises from 0.3 with progress and caps out with 10+
    /// historical samples.
    fn compute_confidence(&self, elapsed_s: f64, total_s: f64, history_key: &str) -> f64 {
        let progress_fraction = if total_s > 0.0 {
            (elapsed_s / total_s).min(1.0)
        } else {
            0.0
        };
        let progress_confidence = 0.3 + 0.7 * progress_fraction;

        let history_count = self
            .state
            .lock()
            .history
            .get(history_key)
            .map_or(0, Vec::len);
        let history_confidence = if history_count >= 10 {
            1.0
        } else {
            0.5 + 0.5 * history_count as f64 / 10.0
        };

        (progress_confidence * history_confidence).min(1.0)
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Printing-phase duration from extrusion speed plus per-layer overhead.
fn estimate_printing_duration(
    layer_count: u32,
    filament_length_mm: f64,
    print_speed_mm_s: f64,
) -> f64 {
    if print_speed_mm_s <= 0.0 || filament_length_mm <= 0.0 {
        return 0.0;
    }
    let effective_speed = print_speed_mm_s * EFFECTIVE_SPEED_FACTOR;
    let extrusion_s = filament_length_mm / effective_speed;

    let first_layer_extra = if layer_count > 0 {
        (extrusion_s / f64::from(layer_count.max(1))) * (1.0 / FIRST_LAYER_SPEED_FACTOR - 1.0)
    } else {
        0.0
    };

    let layer_overhead = FDM_PER_LAYER_OVERHEAD_S * f64::from(layer_count);
    extrusion_s + first_layer_extra + layer_overhead
}

/// Allocate elapsed time across the phase sequence; the first phase not
/// fully consumed becomes the current phase.
fn build_phases(
    durations: &[(PrintPhase, f64); 5],
    elapsed_s: f64,
) -> (Vec<PhaseEstimate>, PrintPhase, f64) {
    let total_duration: f64 = durations.iter().map(|(_, d)| d).sum();
    let mut remaining = elapsed_s;
    let mut current_phase = FDM_PHASES[0];
    let mut found_current = false;
    let mut phases = Vec::with_capacity(durations.len());

    for (phase, duration) in durations {
        if found_current {
            phases.push(PhaseEstimate {
                phase: *phase,
                estimated_duration_s: *duration,
                elapsed_s: 0.0,
                progress_pct: 0.0,
            });
            continue;
        }

        if *duration > 0.0 && remaining >= *duration {
            phases.push(PhaseEstimate {
                phase: *phase,
                estimated_duration_s: *duration,
                elapsed_s: *duration,
                progress_pct: 100.0,
            });
            remaining -= duration;
            current_phase = *phase;
        } else if *duration > 0.0 {
            phases.push(PhaseEstimate {
                phase: *phase,
                estimated_duration_s: *duration,
                elapsed_s: remaining,
                progress_pct: round2(remaining / duration * 100.0),
            });
            current_phase = *phase;
            remaining = 0.0;
            found_current = true;
        } else if *phase != PrintPhase::Complete {
            phases.push(PhaseEstimate {
                phase: *phase,
                estimated_duration_s: 0.0,
                elapsed_s: 0.0,
                progress_pct: 100.0,
            });
            current_phase = *phase;
        } else {
            phases.push(PhaseEstimate {
                phase: *phase,
                estimated_duration_s: 0.0,
                elapsed_s: 0.0,
                progress_pct: 0.0,
            });
        }
    }

    let overall = if total_duration > 0.0 {
        (elapsed_s / total_duration * 100.0).min(100.0)
    } else {
        0.0
    };
    (phases, current_phase, round2(overall))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
