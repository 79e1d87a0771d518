//! Row types exchanged with the durable store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A job row. Mirrors the in-memory queue entry; `status` is the dotted
/// lowercase state string so rows stay readable from the sqlite shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub file_name: String,
    pub printer_name: Option<String>,
    pub status: String,
    pub priority: i64,
    pub submitted_by: String,
    /// Unix seconds.
    pub submitted_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub event_type: String,
    pub data: Value,
    pub source: String,
    pub timestamp: f64,
}

/// A registered printer. The API key is never stored here; only a
/// reference into the credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterRecord {
    pub name: String,
    pub backend: String,
    pub host: String,
    pub credential_id: Option<String>,
    pub registered_at: f64,
    pub last_seen: f64,
}

/// One billing charge. `job_id` is the idempotency key: the table holds at
/// most one row per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub job_id: String,
    pub fee_amount: f64,
    pub fee_percent: f64,
    pub job_cost: f64,
    pub currency: String,
    pub waived: bool,
    pub waiver_reason: Option<String>,
    pub payment_id: Option<String>,
    pub payment_rail: Option<String>,
    pub payment_status: String,
    pub user_email: Option<String>,
    pub timestamp: f64,
}

/// One payment attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub job_id: String,
    pub rail: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub created_at: f64,
}

/// A stored payment method reference (e.g. a Stripe customer id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodRecord {
    pub id: String,
    pub user_id: String,
    pub rail: String,
    pub provider_ref: String,
    pub label: String,
    pub is_default: bool,
    pub created_at: f64,
}

/// One print-DNA outcome row: a geometric fingerprint plus what happened
/// when it was printed with a given setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintDnaRow {
    pub file_hash: String,
    pub geometric_signature: String,
    pub triangle_count: i64,
    pub bbox_mm: (f64, f64, f64),
    pub volume_mm3: f64,
    pub surface_area_mm2: f64,
    pub printer_model: String,
    pub material: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    pub outcome: String,
    pub quality_grade: Option<String>,
    pub failure_mode: Option<String>,
    pub print_time_s: Option<f64>,
    pub timestamp: f64,
}

/// Monthly billing aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub total_fees: f64,
    pub job_count: i64,
    pub waived_count: i64,
}
