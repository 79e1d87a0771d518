//! Material knowledge: temperature targets and the substitution matrix.
//!
//! The substitution matrix answers "I need PETG but only have PLA loaded —
//! is that acceptable, and at what cost?" Rules are bidirectional where
//! chemistry allows it and carry a confidence plus the property deltas a
//! caller should surface to the operator.

use serde::{Deserialize, Serialize};

/// Nominal print temperatures for a material: `(hotend °C, bed °C)`.
pub fn material_temp_targets(material: &str) -> Option<(f64, f64)> {
    match material.to_ascii_uppercase().as_str() {
        "PLA" => Some((210.0, 60.0)),
        "PETG" => Some((240.0, 80.0)),
        "ABS" => Some((250.0, 100.0)),
        "ASA" => Some((255.0, 100.0)),
        "TPU" => Some((225.0, 50.0)),
        "NYLON" | "PA" => Some((260.0, 90.0)),
        "PC" => Some((270.0, 110.0)),
        "HIPS" => Some((235.0, 100.0)),
        "PVA" => Some((200.0, 60.0)),
        _ => None,
    }
}

/// Why a substitution is (or is not) recommended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionReason {
    SimilarMechanical,
    SimilarThermal,
    EasierToPrint,
    CostEquivalent,
    AestheticMatch,
}

/// A single substitution recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialSubstitution {
    pub requested: String,
    pub substitute: String,
    /// 0.0 – 1.0; how well the substitute covers the requested material.
    pub confidence: f64,
    pub reason: SubstitutionReason,
    /// Human-readable caveats (strength loss, temp adjustments, …).
    pub notes: Vec<String>,
    pub requires_temp_adjustment: bool,
}

struct SubRule {
    from: &'static str,
    to: &'static str,
    confidence: f64,
    reason: SubstitutionReason,
    notes: &'static [&'static str],
    temp_adjustment: bool,
}

// Built-in rules. Order matters only for equal-confidence ties.
const RULES: &[SubRule] = &[
    SubRule {
        from: "PLA",
        to: "PETG",
        confidence: 0.85,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["PETG is tougher and more heat resistant", "raise hotend ~30°C, bed ~20°C"],
        temp_adjustment: true,
    },
    SubRule {
        from: "PETG",
        to: "PLA",
        confidence: 0.75,
        reason: SubstitutionReason::EasierToPrint,
        notes: &["PLA is more brittle and softens near 55°C"],
        temp_adjustment: true,
    },
    SubRule {
        from: "ABS",
        to: "ASA",
        confidence: 0.95,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["ASA adds UV stability; print settings nearly identical"],
        temp_adjustment: false,
    },
    SubRule {
        from: "ASA",
        to: "ABS",
        confidence: 0.9,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["ABS yellows outdoors; enclosure recommended for both"],
        temp_adjustment: false,
    },
    SubRule {
        from: "ABS",
        to: "PETG",
        confidence: 0.7,
        reason: SubstitutionReason::SimilarThermal,
        notes: &["PETG needs no enclosure but creeps under sustained load"],
        temp_adjustment: true,
    },
    SubRule {
        from: "PETG",
        to: "ABS",
        confidence: 0.6,
        reason: SubstitutionReason::SimilarThermal,
        notes: &["ABS warps without an enclosure"],
        temp_adjustment: true,
    },
    SubRule {
        from: "NYLON",
        to: "PETG",
        confidence: 0.55,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["PETG lacks nylon's fatigue resistance"],
        temp_adjustment: true,
    },
    SubRule {
        from: "TPU",
        to: "TPE",
        confidence: 0.8,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["check shore hardness against the design"],
        temp_adjustment: false,
    },
    SubRule {
        from: "PLA",
        to: "PLA+",
        confidence: 0.98,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &["PLA+ is a drop-in with slightly better layer adhesion"],
        temp_adjustment: false,
    },
    SubRule {
        from: "PLA+",
        to: "PLA",
        confidence: 0.95,
        reason: SubstitutionReason::SimilarMechanical,
        notes: &[],
        temp_adjustment: false,
    },
    SubRule {
        from: "PC",
        to: "ABS",
        confidence: 0.5,
        reason: SubstitutionReason::SimilarThermal,
        notes: &["significant strength loss; review load cases"],
        temp_adjustment: true,
    },
];

/// Substitution look-ups over the built-in rule matrix.
#[derive(Debug, Default)]
pub struct SubstitutionMatrix;

impl SubstitutionMatrix {
    pub fn new() -> Self {
        Self
    }

    /// All substitutes for `material`, best confidence first.
    pub fn find_substitutes(&self, material: &str) -> Vec<MaterialSubstitution> {
        let wanted = material.to_ascii_uppercase();
        let mut out: Vec<MaterialSubstitution> = RULES
            .iter()
            .filter(|r| r.from == wanted)
            .map(|r| MaterialSubstitution {
                requested: wanted.clone(),
                substitute: r.to.to_string(),
                confidence: r.confidence,
                reason: r.reason,
                notes: r.notes.iter().map(|n| n.to_string()).collect(),
                requires_temp_adjustment: r.temp_adjustment,
            })
            .collect();
        out.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    /// Whether `candidate` is an acceptable stand-in for `requested` at or
    /// above `min_confidence`.
    pub fn is_compatible(&self, requested: &str, candidate: &str, min_confidence: f64) -> bool {
        let requested = requested.to_ascii_uppercase();
        let candidate = candidate.to_ascii_uppercase();
        if requested == candidate {
            return true;
        }
        RULES.iter().any(|r| {
            r.from == requested && r.to == candidate && r.confidence >= min_confidence
        })
    }

    /// The single best substitute, restricted to materials actually
    /// available when `available` is non-empty.
    pub fn get_best_substitute(
        &self,
        requested: &str,
        available: &[String],
    ) -> Option<MaterialSubstitution> {
        self.find_substitutes(requested).into_iter().find(|sub| {
            available.is_empty()
                || available
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(&sub.substitute))
        })
    }
}
