//! License tiers gating network features.

use serde::{Deserialize, Serialize};

/// Ordered license tiers. Anything below `Business` is subject to the
/// monthly free-tier cap on network orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseTier {
    Free,
    Pro,
    Business,
    Enterprise,
}

impl LicenseTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseTier::Free => "free",
            LicenseTier::Pro => "pro",
            LicenseTier::Business => "business",
            LicenseTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pro" => LicenseTier::Pro,
            "business" => LicenseTier::Business,
            "enterprise" => LicenseTier::Enterprise,
            _ => LicenseTier::Free,
        }
    }

    /// Whether this tier is exempt from the monthly network-order cap.
    pub fn unlimited_orders(&self) -> bool {
        *self >= LicenseTier::Business
    }
}
