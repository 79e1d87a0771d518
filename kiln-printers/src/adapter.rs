//! The abstract printer adapter contract.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{
    FirmwareStatus, FirmwareUpdateResult, JobProgress, PrintResult, PrinterCapabilities,
    PrinterFile, PrinterState, UploadResult,
};
use crate::{PrinterError, PrinterResult};

/// Parameters for a firmware-level resume at a recorded Z height.
#[derive(Debug, Clone)]
pub struct FirmwareResumeParams {
    pub z_height_mm: f64,
    pub hotend_temp_c: f64,
    pub bed_temp_c: f64,
    pub file_name: String,
    pub layer_number: Option<u32>,
    pub fan_speed_pct: f64,
    pub flow_rate_pct: f64,
    pub prime_length_mm: f64,
    pub z_clearance_mm: f64,
}

impl FirmwareResumeParams {
    pub fn new(z_height_mm: f64, hotend_temp_c: f64, bed_temp_c: f64, file_name: &str) -> Self {
        Self {
            z_height_mm,
            hotend_temp_c,
            bed_temp_c,
            file_name: file_name.to_string(),
            layer_number: None,
            fan_speed_pct: 100.0,
            flow_rate_pct: 100.0,
            prime_length_mm: 30.0,
            z_clearance_mm: 2.0,
        }
    }
}

/// Abstract base for all printer backend adapters.
///
/// Concrete implementations must provide every required method; the
/// orchestration layer relies on this contract to drive any supported
/// printer without knowledge of the underlying protocol. Optional
/// operations default to `None`/`Unsupported`, mirroring the capability
/// flags.
#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Human-readable backend identifier, e.g. `"octoprint"`.
    fn name(&self) -> &str;

    /// The feature set this adapter supports.
    fn capabilities(&self) -> PrinterCapabilities;

    /// Bind a safety profile; subsequent temperature commands intersect the
    /// caller limit with the profile's maxima.
    fn set_safety_profile(&self, profile_id: &str);

    /// The currently bound safety profile, if any.
    fn safety_profile(&self) -> Option<String>;

    // -- state queries --------------------------------------------------

    /// Current printer state and temperatures. Transient network failures
    /// are reported as `connected=false, status=offline` rather than an
    /// error, so callers always get a usable state.
    async fn get_state(&self) -> PrinterResult<PrinterState>;

    /// Progress info for the active (or most recent) job. Returns the
    /// all-`None` sentinel when nothing is printing.
    async fn get_job(&self) -> PrinterResult<JobProgress>;

    /// Files available on the printer / print server.
    async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>>;

    // -- file management ------------------------------------------------

    /// Upload a local G-code file. The reported file name may differ from
    /// the local one (8.3 rewrites, directory roots).
    async fn upload_file(&self, local_path: &Path) -> PrinterResult<UploadResult>;

    /// Delete a file from the printer's storage.
    async fn delete_file(&self, remote_path: &str) -> PrinterResult<bool>;

    // -- print control --------------------------------------------------

    async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult>;
    async fn cancel_print(&self) -> PrinterResult<PrintResult>;
    async fn pause_print(&self) -> PrinterResult<PrintResult>;
    async fn resume_print(&self) -> PrinterResult<PrintResult>;

    /// Firmware-level immediate halt (M112 or equivalent). Unlike
    /// `cancel_print` there is no cooldown sequence.
    async fn emergency_stop(&self) -> PrinterResult<PrintResult>;

    // -- temperature control --------------------------------------------

    /// Set the hot-end target in °C; 0 turns the heater off.
    async fn set_tool_temp(&self, target_c: f64) -> PrinterResult<bool>;

    /// Set the heated-bed target in °C; 0 turns the heater off.
    async fn set_bed_temp(&self, target_c: f64) -> PrinterResult<bool>;

    // -- G-code ---------------------------------------------------------

    /// Send one or more G-code commands in a single batch.
    async fn send_gcode(&self, commands: &[String]) -> PrinterResult<bool>;

    // -- optional operations --------------------------------------------

    /// Webcam snapshot bytes, or `None` when no webcam is available.
    async fn get_snapshot(&self) -> PrinterResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// MJPEG stream URL, when the backend exposes one.
    fn get_stream_url(&self) -> Option<String> {
        None
    }

    /// Firmware/software update status, when supported.
    async fn get_firmware_status(&self) -> PrinterResult<Option<FirmwareStatus>> {
        Ok(None)
    }

    /// Trigger a firmware update for one component (or all).
    async fn update_firmware(
        &self,
        _component: Option<&str>,
    ) -> PrinterResult<FirmwareUpdateResult> {
        Err(PrinterError::Unsupported(format!(
            "{} adapter does not support firmware updates",
            self.name()
        )))
    }

    /// Roll a component back to its previous version.
    async fn rollback_firmware(&self, _component: &str) -> PrinterResult<FirmwareUpdateResult> {
        Err(PrinterError::Unsupported(format!(
            "{} adapter does not support firmware rollback",
            self.name()
        )))
    }

    /// Current bed mesh / probe data.
    async fn get_bed_mesh(&self) -> PrinterResult<Option<Value>> {
        Ok(None)
    }

    /// Filament runout sensor state.
    async fn get_filament_status(&self) -> PrinterResult<Option<Value>> {
        Ok(None)
    }

    /// Resume a print mid-job at a recorded Z height via raw G-code.
    async fn firmware_resume_print(
        &self,
        _params: FirmwareResumeParams,
    ) -> PrinterResult<PrintResult> {
        Err(PrinterError::Unsupported(format!(
            "{} adapter does not support firmware resume",
            self.name()
        )))
    }
}
