//! Per-printer safety profiles and temperature validation.
//!
//! A profile stores the machine's absolute temperature maxima. When an
//! adapter is bound to a profile, every temperature-set call intersects the
//! caller-supplied limit with the profile's maxima before anything hits the
//! wire. Profile limits tighten caller limits, never replace them.

use crate::{PrinterError, PrinterResult};

/// Temperature ceilings for one printer model.
#[derive(Debug, Clone, Copy)]
pub struct SafetyProfile {
    pub id: &'static str,
    pub max_hotend_temp: f64,
    pub max_bed_temp: f64,
}

const PROFILES: &[SafetyProfile] = &[
    SafetyProfile { id: "generic_fdm", max_hotend_temp: 280.0, max_bed_temp: 110.0 },
    SafetyProfile { id: "ender3", max_hotend_temp: 260.0, max_bed_temp: 100.0 },
    SafetyProfile { id: "voron_24", max_hotend_temp: 300.0, max_bed_temp: 120.0 },
    SafetyProfile { id: "prusa_mk4", max_hotend_temp: 290.0, max_bed_temp: 120.0 },
    SafetyProfile { id: "bambu_x1c", max_hotend_temp: 300.0, max_bed_temp: 120.0 },
];

/// Look up a built-in profile by id.
pub fn get_profile(profile_id: &str) -> Option<SafetyProfile> {
    PROFILES.iter().find(|p| p.id == profile_id).copied()
}

/// Which heater a temperature command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    Hotend,
    Bed,
}

impl Heater {
    fn label(&self) -> &'static str {
        match self {
            Heater::Hotend => "hotend",
            Heater::Bed => "bed",
        }
    }
}

/// Validate a target temperature against the caller limit and, when a
/// profile is bound, the profile maxima.
pub fn validate_temp(
    target: f64,
    mut max_temp: f64,
    heater: Heater,
    profile_id: Option<&str>,
) -> PrinterResult<()> {
    if let Some(profile) = profile_id.and_then(get_profile) {
        let profile_max = match heater {
            Heater::Hotend => profile.max_hotend_temp,
            Heater::Bed => profile.max_bed_temp,
        };
        max_temp = max_temp.min(profile_max);
    }

    if target < 0.0 {
        return Err(PrinterError::Validation(format!(
            "{} temperature {target}°C is negative, must be >= 0",
            heater.label()
        )));
    }
    if target > max_temp {
        return Err(PrinterError::Validation(format!(
            "{} temperature {target}°C exceeds safety limit ({max_temp}°C)",
            heater.label()
        )));
    }
    Ok(())
}
