//! Event record and the closed set of event types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// All event types emitted by the Kiln system.
///
/// The serialized form is the dotted string (`"job.queued"`); prefix
/// subscriptions match against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Job lifecycle
    #[serde(rename = "job.submitted")]
    JobSubmitted,
    #[serde(rename = "job.queued")]
    JobQueued,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.stuck_timeout")]
    JobStuckTimeout,

    // Printer state
    #[serde(rename = "printer.connected")]
    PrinterConnected,
    #[serde(rename = "printer.disconnected")]
    PrinterDisconnected,
    #[serde(rename = "printer.error")]
    PrinterError,
    #[serde(rename = "printer.idle")]
    PrinterIdle,

    // Print progress
    #[serde(rename = "print.started")]
    PrintStarted,
    #[serde(rename = "print.paused")]
    PrintPaused,
    #[serde(rename = "print.resumed")]
    PrintResumed,
    #[serde(rename = "print.completed")]
    PrintCompleted,
    #[serde(rename = "print.failed")]
    PrintFailed,
    #[serde(rename = "print.cancelled")]
    PrintCancelled,
    #[serde(rename = "print.progress")]
    PrintProgress,
    #[serde(rename = "print.terminal")]
    PrintTerminal,

    // Safety
    #[serde(rename = "safety.temperature_warning")]
    TemperatureWarning,
    #[serde(rename = "safety.preflight_failed")]
    PreflightFailed,
    #[serde(rename = "safety.blocked")]
    SafetyBlocked,
    #[serde(rename = "safety.escalated")]
    SafetyEscalated,

    // File
    #[serde(rename = "file.uploaded")]
    FileUploaded,

    // Billing / payments
    #[serde(rename = "payment.initiated")]
    PaymentInitiated,
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "billing.spend_limit_reached")]
    SpendLimitReached,

    // Fulfillment
    #[serde(rename = "fulfillment.quoted")]
    FulfillmentQuoted,
    #[serde(rename = "fulfillment.ordered")]
    FulfillmentOrdered,
    #[serde(rename = "fulfillment.cancelled")]
    FulfillmentCancelled,
    #[serde(rename = "fulfillment.failed")]
    FulfillmentFailed,

    // Vision monitoring
    #[serde(rename = "vision.check")]
    VisionCheck,
    #[serde(rename = "vision.alert")]
    VisionAlert,
}

impl EventType {
    /// The dotted string form, e.g. `"print.completed"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobSubmitted => "job.submitted",
            EventType::JobQueued => "job.queued",
            EventType::JobStarted => "job.started",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
            EventType::JobStuckTimeout => "job.stuck_timeout",
            EventType::PrinterConnected => "printer.connected",
            EventType::PrinterDisconnected => "printer.disconnected",
            EventType::PrinterError => "printer.error",
            EventType::PrinterIdle => "printer.idle",
            EventType::PrintStarted => "print.started",
            EventType::PrintPaused => "print.paused",
            EventType::PrintResumed => "print.resumed",
            EventType::PrintCompleted => "print.completed",
            EventType::PrintFailed => "print.failed",
            EventType::PrintCancelled => "print.cancelled",
            EventType::PrintProgress => "print.progress",
            EventType::PrintTerminal => "print.terminal",
            EventType::TemperatureWarning => "safety.temperature_warning",
            EventType::PreflightFailed => "safety.preflight_failed",
            EventType::SafetyBlocked => "safety.blocked",
            EventType::SafetyEscalated => "safety.escalated",
            EventType::FileUploaded => "file.uploaded",
            EventType::PaymentInitiated => "payment.initiated",
            EventType::PaymentCompleted => "payment.completed",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentRefunded => "payment.refunded",
            EventType::SpendLimitReached => "billing.spend_limit_reached",
            EventType::FulfillmentQuoted => "fulfillment.quoted",
            EventType::FulfillmentOrdered => "fulfillment.ordered",
            EventType::FulfillmentCancelled => "fulfillment.cancelled",
            EventType::FulfillmentFailed => "fulfillment.failed",
            EventType::VisionCheck => "vision.check",
            EventType::VisionAlert => "vision.alert",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Unix timestamp (seconds).
    pub timestamp: f64,
    /// Origin, e.g. `"printer:voron-350"` or `"queue"`.
    #[serde(default)]
    pub source: String,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(event_type: EventType, data: Map<String, Value>, source: impl Into<String>) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            source: source.into(),
        }
    }

    /// Build an event with an empty payload.
    pub fn of(event_type: EventType) -> Self {
        Self::new(event_type, Map::new(), "")
    }

    /// Convenience constructor from a `serde_json::json!` object.
    ///
    /// Non-object values produce an empty payload.
    pub fn with_payload(event_type: EventType, payload: Value, source: impl Into<String>) -> Self {
        let data = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(event_type, data, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_serializes_to_dotted_string() {
        let s = serde_json::to_string(&EventType::PrintCompleted).unwrap();
        assert_eq!(s, "\"print.completed\"");
    }

    #[test]
    fn event_type_round_trips() {
        let parsed: EventType = serde_json::from_str("\"payment.failed\"").unwrap();
        assert_eq!(parsed, EventType::PaymentFailed);
    }

    #[test]
    fn as_str_matches_serde_rename() {
        for ty in [
            EventType::JobQueued,
            EventType::SafetyEscalated,
            EventType::VisionCheck,
            EventType::SpendLimitReached,
        ] {
            let via_serde = serde_json::to_value(ty).unwrap();
            assert_eq!(via_serde, json!(ty.as_str()));
        }
    }

    #[test]
    fn with_payload_keeps_object_fields() {
        let event = Event::with_payload(
            EventType::VisionCheck,
            json!({"printer_name": "voron", "completion": 45.0}),
            "vision",
        );
        assert_eq!(event.data["printer_name"], json!("voron"));
        assert_eq!(event.source, "vision");
        assert!(event.timestamp > 0.0);
    }
}
