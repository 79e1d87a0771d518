//! Emergency stop and safety interlock coordination.
//!
//! The coordinator tracks interlock states, records stop events, and
//! enforces the invariant that a printer cannot resume until all critical
//! interlocks are re-engaged. For FDM printers the fallback emergency
//! sequence is M112 (firmware halt), M104 S0 (hotend off), M140 S0 (bed
//! off), M84 (steppers off).
//!
//! A stop is recorded even when G-code delivery fails: physical state
//! after an e-stop attempt is indeterminate and must be treated as halted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use kiln_events::{Event, EventBus, EventType};
use kiln_printers::{PrinterRegistry, PrinterStatus};

use crate::material::material_temp_targets;
use crate::{now_ts, EngineError, EngineResult};

const FDM_EMERGENCY_GCODE: [&str; 4] = ["M112", "M104 S0", "M140 S0", "M84"];
const FDM_EMERGENCY_ACTIONS: [&str; 4] = [
    "emergency_stop_m112",
    "hotend_heater_off",
    "bed_heater_off",
    "steppers_disabled",
];

/// How far above the material's nominal targets a heater may sit before
/// preflight refuses to start a job.
const PREFLIGHT_TEMP_TOLERANCE_C: f64 = 15.0;

/// Reason codes for emergency stop events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyReason {
    UserRequest,
    ThermalRunaway,
    CollisionDetected,
    MaterialJam,
    PowerAnomaly,
    SoftwareFault,
    InterlockBreach,
    AgentRequest,
}

impl EmergencyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyReason::UserRequest => "user_request",
            EmergencyReason::ThermalRunaway => "thermal_runaway",
            EmergencyReason::CollisionDetected => "collision_detected",
            EmergencyReason::MaterialJam => "material_jam",
            EmergencyReason::PowerAnomaly => "power_anomaly",
            EmergencyReason::SoftwareFault => "software_fault",
            EmergencyReason::InterlockBreach => "interlock_breach",
            EmergencyReason::AgentRequest => "agent_request",
        }
    }
}

/// Outcome of an emergency stop command on a single printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyRecord {
    pub printer_id: String,
    /// `true` if the stop was delivered.
    pub success: bool,
    pub reason: EmergencyReason,
    pub timestamp: f64,
    pub actions_taken: Vec<String>,
    pub gcode_sent: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of a single safety interlock on a printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyInterlock {
    pub name: String,
    pub printer_id: String,
    pub is_engaged: bool,
    /// Critical interlocks force an immediate stop on disengage and gate
    /// clearing the stop.
    pub is_critical: bool,
    pub last_checked: f64,
}

impl SafetyInterlock {
    pub fn new(name: &str, printer_id: &str, is_engaged: bool, is_critical: bool) -> Self {
        Self {
            name: name.to_string(),
            printer_id: printer_id.to_string(),
            is_engaged,
            is_critical,
            last_checked: now_ts(),
        }
    }
}

/// Result of a per-job preflight validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub printer_id: String,
    pub passed: bool,
    pub checks: Vec<PreflightCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Default)]
struct CoordinatorState {
    interlocks: HashMap<(String, String), SafetyInterlock>,
    stop_history: Vec<EmergencyRecord>,
    stopped_printers: HashSet<String>,
}

/// Central coordinator for emergency stops, interlocks and preflight.
///
/// All mutable state sits behind a single lock; public methods are safe to
/// call re-entrantly from event handlers.
pub struct EmergencyCoordinator {
    state: Mutex<CoordinatorState>,
    registry: Arc<PrinterRegistry>,
    bus: Option<Arc<EventBus>>,
}

impl EmergencyCoordinator {
    pub fn new(registry: Arc<PrinterRegistry>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            registry,
            bus,
        }
    }

    // -- stop operations ---------------------------------------------------

    /// Execute an immediate emergency stop on one printer.
    ///
    /// Attempts the adapter's native `emergency_stop()` first; on failure
    /// falls back to sending the FDM G-code ladder one command at a time so
    /// partial delivery still disables heaters. The stop is recorded and
    /// the printer marked stopped regardless of delivery success.
    pub async fn emergency_stop(
        &self,
        printer_id: &str,
        reason: EmergencyReason,
    ) -> EmergencyRecord {
        let actions: Vec<String> = FDM_EMERGENCY_ACTIONS.iter().map(|s| s.to_string()).collect();
        let (gcode_sent, error) = match self.deliver_stop(printer_id).await {
            Ok(gcode) => (gcode, None),
            Err(err) => {
                tracing::error!(printer = printer_id, error = %err, "failed to deliver emergency G-code");
                (Vec::new(), Some(format!("G-code delivery failed: {err}")))
            }
        };

        let record = EmergencyRecord {
            printer_id: printer_id.to_string(),
            success: error.is_none(),
            reason,
            timestamp: now_ts(),
            actions_taken: actions.clone(),
            gcode_sent,
            error,
        };

        {
            let mut state = self.state.lock();
            state.stopped_printers.insert(printer_id.to_string());
            state.stop_history.push(record.clone());
        }

        tracing::warn!(
            printer = printer_id,
            reason = reason.as_str(),
            success = record.success,
            "EMERGENCY STOP"
        );

        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(
                EventType::SafetyEscalated,
                json!({
                    "printer_id": printer_id,
                    "reason": reason.as_str(),
                    "actions": actions,
                    "event": "emergency_stop",
                }),
                format!("emergency:{printer_id}"),
            ));
        }

        record
    }

    /// Stop every known printer: registered printers, printers already in
    /// the stopped set, and printers owning interlocks. Processed in
    /// sorted order for deterministic logs.
    pub async fn emergency_stop_all(&self, reason: EmergencyReason) -> Vec<EmergencyRecord> {
        let mut printer_ids: HashSet<String> = {
            let state = self.state.lock();
            let mut ids: HashSet<String> = state.stopped_printers.clone();
            ids.extend(state.interlocks.keys().map(|(pid, _)| pid.clone()));
            ids
        };
        printer_ids.extend(self.registry.list_names());

        let mut sorted: Vec<String> = printer_ids.into_iter().collect();
        sorted.sort();

        let mut results = Vec::with_capacity(sorted.len());
        for printer_id in sorted {
            results.push(self.emergency_stop(&printer_id, reason).await);
        }
        results
    }

    async fn deliver_stop(&self, printer_id: &str) -> EngineResult<Vec<String>> {
        let adapter = self
            .registry
            .get(printer_id)
            .ok_or_else(|| EngineError::Validation(format!("printer {printer_id:?} is not registered")))?;

        let gcode: Vec<String> = FDM_EMERGENCY_GCODE.iter().map(|s| s.to_string()).collect();

        // Hardware-level halt is the fastest path.
        match adapter.emergency_stop().await {
            Ok(result) if result.success => {
                tracing::info!(printer = printer_id, "hardware emergency_stop succeeded");
                return Ok(gcode);
            }
            Ok(result) => {
                tracing::warn!(
                    printer = printer_id,
                    message = %result.message,
                    "hardware emergency_stop reported failure, falling back to G-code"
                );
            }
            Err(err) => {
                tracing::warn!(
                    printer = printer_id,
                    error = %err,
                    "hardware emergency_stop raised, falling back to G-code"
                );
            }
        }

        // Send commands individually: partial delivery still kills heaters
        // even if a later command fails.
        let mut last_error: Option<EngineError> = None;
        for cmd in &gcode {
            if let Err(err) = adapter.send_gcode(std::slice::from_ref(cmd)).await {
                tracing::error!(printer = printer_id, command = %cmd, error = %err, "G-code send failed");
                last_error = Some(err.into());
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(gcode),
        }
    }

    // -- interlock management ----------------------------------------------

    /// Register or replace an interlock.
    pub fn register_interlock(&self, interlock: SafetyInterlock) {
        tracing::info!(
            printer = %interlock.printer_id,
            name = %interlock.name,
            critical = interlock.is_critical,
            engaged = interlock.is_engaged,
            "interlock registered"
        );
        let key = (interlock.printer_id.clone(), interlock.name.clone());
        self.state.lock().interlocks.insert(key, interlock);
    }

    /// Update the engaged state of a registered interlock. A critical
    /// interlock transitioning to disengaged triggers an immediate stop
    /// with [`EmergencyReason::InterlockBreach`].
    pub async fn update_interlock(
        &self,
        printer_id: &str,
        name: &str,
        is_engaged: bool,
    ) -> EngineResult<()> {
        let is_critical = {
            let mut state = self.state.lock();
            let interlock = state
                .interlocks
                .get_mut(&(printer_id.to_string(), name.to_string()))
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "interlock {name:?} not registered for printer {printer_id:?}"
                    ))
                })?;
            interlock.is_engaged = is_engaged;
            interlock.last_checked = now_ts();
            interlock.is_critical
        };

        if is_critical && !is_engaged {
            tracing::warn!(
                printer = printer_id,
                interlock = name,
                "CRITICAL interlock disengaged, triggering emergency stop"
            );
            self.emergency_stop(printer_id, EmergencyReason::InterlockBreach)
                .await;
        }
        Ok(())
    }

    /// All registered interlocks for a printer.
    pub fn check_interlocks(&self, printer_id: &str) -> Vec<SafetyInterlock> {
        self.state
            .lock()
            .interlocks
            .iter()
            .filter(|((pid, _), _)| pid == printer_id)
            .map(|(_, il)| il.clone())
            .collect()
    }

    // -- stop state --------------------------------------------------------

    /// Whether a printer is currently in the emergency-stopped set.
    pub fn is_stopped(&self, printer_id: &str) -> bool {
        self.state.lock().stopped_printers.contains(printer_id)
    }

    /// Acknowledge and clear a stop. Refused while any critical interlock
    /// for the printer is disengaged, or when the printer was not stopped.
    pub fn clear_stop(&self, printer_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.stopped_printers.contains(printer_id) {
            return false;
        }
        for ((pid, _), interlock) in &state.interlocks {
            if pid == printer_id && interlock.is_critical && !interlock.is_engaged {
                tracing::warn!(
                    printer = printer_id,
                    interlock = %interlock.name,
                    "cannot clear e-stop: critical interlock disengaged"
                );
                return false;
            }
        }
        state.stopped_printers.remove(printer_id);
        tracing::info!(printer = printer_id, "e-stop cleared");
        true
    }

    /// Recent emergency stops, most recent first.
    pub fn stop_history(&self, printer_id: Option<&str>, limit: usize) -> Vec<EmergencyRecord> {
        let state = self.state.lock();
        let mut history: Vec<EmergencyRecord> = state
            .stop_history
            .iter()
            .filter(|r| printer_id.map_or(true, |p| r.printer_id == p))
            .cloned()
            .collect();
        history.reverse();
        history.truncate(limit);
        history
    }

    // -- preflight ---------------------------------------------------------

    /// Validate a printer before a job start: connected, idle, temperatures
    /// within material tolerance, and — when a sliced file is supplied —
    /// the G-code safety scan. Failing any check surfaces
    /// [`EngineError::PreflightFailed`] without mutating queue state.
    pub async fn preflight(
        &self,
        printer_id: &str,
        material: Option<&str>,
        gcode: Option<&str>,
    ) -> EngineResult<PreflightReport> {
        let mut checks = Vec::new();

        if self.is_stopped(printer_id) {
            return self.preflight_fail(
                printer_id,
                checks,
                "emergency_stop_clear",
                format!("printer {printer_id:?} is in emergency-stopped state"),
            );
        }
        checks.push(PreflightCheck {
            name: "emergency_stop_clear".into(),
            passed: true,
            detail: None,
        });

        let Some(adapter) = self.registry.get(printer_id) else {
            return self.preflight_fail(
                printer_id,
                checks,
                "printer_registered",
                format!("printer {printer_id:?} is not registered"),
            );
        };
        checks.push(PreflightCheck {
            name: "printer_registered".into(),
            passed: true,
            detail: None,
        });

        let state = adapter.get_state().await?;
        if !state.connected {
            return self.preflight_fail(
                printer_id,
                checks,
                "printer_connected",
                "printer is not connected".into(),
            );
        }
        checks.push(PreflightCheck {
            name: "printer_connected".into(),
            passed: true,
            detail: None,
        });

        if state.status != PrinterStatus::Idle {
            return self.preflight_fail(
                printer_id,
                checks,
                "printer_idle",
                format!("printer status is {}, expected idle", state.status),
            );
        }
        checks.push(PreflightCheck {
            name: "printer_idle".into(),
            passed: true,
            detail: None,
        });

        if let Some(material) = material {
            if let Some((tool_target, bed_target)) = material_temp_targets(material) {
                let tool_ok = state
                    .tool_temp_actual
                    .map_or(true, |t| t <= tool_target + PREFLIGHT_TEMP_TOLERANCE_C);
                let bed_ok = state
                    .bed_temp_actual
                    .map_or(true, |t| t <= bed_target + PREFLIGHT_TEMP_TOLERANCE_C);
                if !tool_ok || !bed_ok {
                    return self.preflight_fail(
                        printer_id,
                        checks,
                        "material_temps",
                        format!(
                            "heaters too hot for {material}: tool {:?}/{tool_target}, bed {:?}/{bed_target}",
                            state.tool_temp_actual, state.bed_temp_actual
                        ),
                    );
                }
                checks.push(PreflightCheck {
                    name: "material_temps".into(),
                    passed: true,
                    detail: None,
                });
            }
        }

        if let Some(gcode) = gcode {
            if let Some(problem) = scan_gcode_safety(gcode) {
                return self.preflight_fail(printer_id, checks, "gcode_safety", problem);
            }
            checks.push(PreflightCheck {
                name: "gcode_safety".into(),
                passed: true,
                detail: None,
            });
        }

        Ok(PreflightReport {
            printer_id: printer_id.to_string(),
            passed: true,
            checks,
        })
    }

    fn preflight_fail(
        &self,
        printer_id: &str,
        mut checks: Vec<PreflightCheck>,
        name: &str,
        detail: String,
    ) -> EngineResult<PreflightReport> {
        checks.push(PreflightCheck {
            name: name.to_string(),
            passed: false,
            detail: Some(detail.clone()),
        });
        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(
                EventType::PreflightFailed,
                json!({"printer_id": printer_id, "check": name, "detail": detail}),
                "safety",
            ));
        }
        Err(EngineError::PreflightFailed(format!("{name}: {detail}")))
    }
}

/// Scan sliced G-code for obviously unsafe commands. Returns a problem
/// description, or `None` when the file passes.
fn scan_gcode_safety(gcode: &str) -> Option<String> {
    for (line_no, raw) in gcode.lines().enumerate() {
        let line = raw.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("M302") {
            return Some(format!("line {}: cold extrusion enabled (M302)", line_no + 1));
        }
        for (prefix, limit, label) in [
            ("M104", 300.0, "hotend"),
            ("M109", 300.0, "hotend"),
            ("M140", 120.0, "bed"),
            ("M190", 120.0, "bed"),
        ] {
            if let Some(rest) = line.strip_prefix(prefix) {
                if let Some(value) = parse_s_value(rest) {
                    if value > limit {
                        return Some(format!(
                            "line {}: {label} target {value}°C exceeds {limit}°C",
                            line_no + 1
                        ));
                    }
                }
            }
        }
    }
    None
}

fn parse_s_value(args: &str) -> Option<f64> {
    args.split_whitespace()
        .find_map(|tok| tok.strip_prefix('S'))
        .and_then(|v| v.parse::<f64>().ok())
}
