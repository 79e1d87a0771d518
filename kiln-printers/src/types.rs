//! Structured return types shared by every adapter.

use serde::{Deserialize, Serialize};

/// High-level operational state of a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Paused,
    Error,
    Offline,
    Busy,
    Cancelling,
    Unknown,
}

impl PrinterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterStatus::Idle => "idle",
            PrinterStatus::Printing => "printing",
            PrinterStatus::Paused => "paused",
            PrinterStatus::Error => "error",
            PrinterStatus::Offline => "offline",
            PrinterStatus::Busy => "busy",
            PrinterStatus::Cancelling => "cancelling",
            PrinterStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of physical fabrication devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Fdm,
    Sla,
    Cnc,
    Laser,
    Generic,
}

/// Snapshot of the printer's current state and temperatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterState {
    pub connected: bool,
    pub status: PrinterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_temp_actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_temp_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temp_actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temp_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chamber_temp_actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chamber_temp_target: Option<f64>,
}

impl PrinterState {
    /// State reported when the printer cannot be reached.
    pub fn offline() -> Self {
        Self {
            connected: false,
            status: PrinterStatus::Offline,
            tool_temp_actual: None,
            tool_temp_target: None,
            bed_temp_actual: None,
            bed_temp_target: None,
            chamber_temp_actual: None,
            chamber_temp_target: None,
        }
    }

    /// Connected state with no temperature data.
    pub fn connected(status: PrinterStatus) -> Self {
        Self {
            connected: true,
            status,
            ..Self::offline()
        }
    }
}

/// Progress information for the active (or most recent) job.
///
/// All fields `None` is the "no active job" sentinel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// 0.0 – 100.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_time_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_time_left_seconds: Option<i64>,
}

impl JobProgress {
    /// Sentinel returned while the printer is idle.
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Metadata for a single file stored on the printer / print server.
///
/// G-code metadata fields are optional; serialisation omits the missing
/// ones to keep listings compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterFile {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Unix timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slicer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filament_used_mm: Option<f64>,
}

impl PrinterFile {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size_bytes: None,
            date: None,
            material: None,
            estimated_time_seconds: None,
            tool_temp: None,
            bed_temp: None,
            slicer: None,
            layer_height: None,
            filament_used_mm: None,
        }
    }
}

/// Outcome of a file-upload operation.
///
/// `file_name` is the name as stored by the printer, which may differ from
/// the local name (8.3 rewrites, directory roots).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_name: String,
    pub message: String,
}

/// Outcome of a print-control operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl PrintResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            job_id: None,
        }
    }
}

/// Declares what a specific adapter is able to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    pub can_upload: bool,
    pub can_set_temp: bool,
    pub can_send_gcode: bool,
    pub can_pause: bool,
    pub can_stream: bool,
    pub can_snapshot: bool,
    pub can_probe_bed: bool,
    pub can_update_firmware: bool,
    pub can_detect_filament: bool,
    pub device_type: DeviceType,
    pub supported_extensions: Vec<String>,
}

impl Default for PrinterCapabilities {
    fn default() -> Self {
        Self {
            can_upload: true,
            can_set_temp: true,
            can_send_gcode: true,
            can_pause: true,
            can_stream: false,
            can_snapshot: false,
            can_probe_bed: false,
            can_update_firmware: false,
            can_detect_filament: false,
            device_type: DeviceType::Fdm,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
        }
    }
}

impl PrinterCapabilities {
    /// Check a file extension against the supported list (case-insensitive).
    pub fn supports_extension(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.supported_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
    }
}

/// A single updatable software/firmware component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareComponent {
    pub name: String,
    pub current_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<String>,
    pub update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_version: Option<String>,
    #[serde(default)]
    pub component_type: String,
    #[serde(default)]
    pub channel: String,
}

/// Firmware/software update status for a printer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareStatus {
    pub busy: bool,
    pub components: Vec<FirmwareComponent>,
    pub updates_available: usize,
}

/// Outcome of a firmware update or rollback operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_match_contract() {
        let caps = PrinterCapabilities::default();
        assert!(caps.can_upload);
        assert!(caps.can_set_temp);
        assert!(caps.can_send_gcode);
        assert!(caps.can_pause);
        assert!(!caps.can_snapshot);
        assert!(!caps.can_stream);
        assert_eq!(caps.device_type, DeviceType::Fdm);
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let caps = PrinterCapabilities::default();
        assert!(caps.supports_extension("Benchy.GCODE"));
        assert!(caps.supports_extension("part.gco"));
        assert!(!caps.supports_extension("model.stl"));
    }

    #[test]
    fn printer_state_serializes_status_as_string() {
        let state = PrinterState::connected(PrinterStatus::Printing);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "printing");
        assert_eq!(json["connected"], true);
        // Missing temps are omitted, not null.
        assert!(json.get("tool_temp_actual").is_none());
    }

    #[test]
    fn printer_file_omits_missing_metadata() {
        let file = PrinterFile::new("benchy.gcode", "gcodes/benchy.gcode");
        let json = serde_json::to_value(&file).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("material"));
        assert!(!obj.contains_key("slicer"));
        assert_eq!(obj["name"], "benchy.gcode");
    }

    #[test]
    fn idle_job_progress_is_all_none() {
        let progress = JobProgress::idle();
        assert!(progress.file_name.is_none());
        assert!(progress.completion.is_none());
    }
}
