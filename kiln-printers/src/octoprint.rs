//! OctoPrint adapter.
//!
//! Talks to the OctoPrint REST API with `X-Api-Key` authentication. Also
//! carries the Marlin firmware-resume sequence, which restarts a print at
//! a recorded Z height after power loss.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::adapter::{FirmwareResumeParams, PrinterAdapter};
use crate::http::{json_path, HttpTransport, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::profiles::{validate_temp, Heater};
use crate::types::{
    JobProgress, PrintResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus,
    UploadResult,
};
use crate::{PrinterError, PrinterResult};

/// Format a float for G-code: always at least one decimal place, so the
/// firmware sees `S60.0` rather than `S60`.
fn fmt_gcode_f(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Build the Marlin resume sequence. Order is a safety contract:
/// power-loss recovery off first, X/Y homed (never Z), bed heating issued
/// before the hotend wait so thermal expansion re-adheres the part, Z set
/// by G92 without movement, and the Z raise bracketed by G91/G90.
fn build_resume_sequence(params: &FirmwareResumeParams) -> Vec<String> {
    let fan_pwm = (params.fan_speed_pct * 2.55) as i64;
    vec![
        "M413 S0".to_string(),
        "G28 X Y".to_string(),
        format!("M140 S{}", fmt_gcode_f(params.bed_temp_c)),
        format!("M104 S{}", fmt_gcode_f(params.hotend_temp_c)),
        format!("M190 S{}", fmt_gcode_f(params.bed_temp_c)),
        format!("M109 S{}", fmt_gcode_f(params.hotend_temp_c)),
        "G92 E0".to_string(),
        format!("G92 Z{}", fmt_gcode_f(params.z_height_mm)),
        "G91".to_string(),
        format!("G1 Z{} F300", fmt_gcode_f(params.z_clearance_mm)),
        "G90".to_string(),
        format!("G1 E{} F200", fmt_gcode_f(params.prime_length_mm)),
        "G92 E0".to_string(),
        format!("M106 S{fan_pwm}"),
        format!("M221 S{}", params.flow_rate_pct as i64),
    ]
}

fn validate_resume_params(params: &FirmwareResumeParams) -> PrinterResult<()> {
    if params.z_height_mm <= 0.0 {
        return Err(PrinterError::Validation("z_height_mm must be > 0".into()));
    }
    if params.z_clearance_mm <= 0.0 || params.z_clearance_mm > 10.0 {
        return Err(PrinterError::Validation(
            "z_clearance_mm must be > 0 and <= 10".into(),
        ));
    }
    if params.prime_length_mm < 0.0 {
        return Err(PrinterError::Validation("prime_length_mm must be >= 0".into()));
    }
    if params.hotend_temp_c <= 0.0 {
        return Err(PrinterError::Validation(
            "Hotend temperature must be > 0 for resume".into(),
        ));
    }
    if params.bed_temp_c < 0.0 {
        return Err(PrinterError::Validation("Bed temperature must be >= 0".into()));
    }
    Ok(())
}

/// Concrete adapter backed by the OctoPrint REST API.
pub struct OctoPrintAdapter {
    transport: HttpTransport,
    safety_profile: Mutex<Option<String>>,
}

impl OctoPrintAdapter {
    pub fn new(host: &str, api_key: &str) -> PrinterResult<Self> {
        Self::with_transport_options(host, api_key, DEFAULT_TIMEOUT_SECS, DEFAULT_RETRIES)
    }

    pub fn with_transport_options(
        host: &str,
        api_key: &str,
        timeout_secs: u64,
        retries: u32,
    ) -> PrinterResult<Self> {
        Ok(Self {
            transport: HttpTransport::new("octoprint", host, Some(api_key), timeout_secs, retries)?,
            safety_profile: Mutex::new(None),
        })
    }

    fn map_flags(state: &Value) -> PrinterStatus {
        let flag = |name: &str| {
            json_path(state, &["flags", name])
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        if flag("error") || flag("closedOrError") {
            PrinterStatus::Error
        } else if flag("cancelling") {
            PrinterStatus::Cancelling
        } else if flag("paused") || flag("pausing") {
            PrinterStatus::Paused
        } else if flag("printing") {
            PrinterStatus::Printing
        } else if flag("operational") || flag("ready") {
            PrinterStatus::Idle
        } else {
            PrinterStatus::Unknown
        }
    }
}

#[async_trait]
impl PrinterAdapter for OctoPrintAdapter {
    fn name(&self) -> &str {
        "octoprint"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_stream: true,
            can_snapshot: true,
            ..PrinterCapabilities::default()
        }
    }

    fn set_safety_profile(&self, profile_id: &str) {
        *self.safety_profile.lock() = Some(profile_id.to_string());
    }

    fn safety_profile(&self) -> Option<String> {
        self.safety_profile.lock().clone()
    }

    async fn get_state(&self) -> PrinterResult<PrinterState> {
        let payload = match self.transport.get_json("/api/printer", &[]).await {
            Ok(payload) => payload,
            Err(err) if err.is_transient() => return Ok(PrinterState::offline()),
            // OctoPrint answers 409 when the printer is not connected.
            Err(PrinterError::Http { status: 409, .. }) => {
                return Ok(PrinterState::offline());
            }
            Err(err) => return Err(err),
        };

        let status = json_path(&payload, &["state"])
            .map(Self::map_flags)
            .unwrap_or(PrinterStatus::Unknown);

        let temp = |heater: &str, field: &str| {
            json_path(&payload, &["temperature", heater, field]).and_then(Value::as_f64)
        };

        Ok(PrinterState {
            connected: true,
            status,
            tool_temp_actual: temp("tool0", "actual"),
            tool_temp_target: temp("tool0", "target"),
            bed_temp_actual: temp("bed", "actual"),
            bed_temp_target: temp("bed", "target"),
            chamber_temp_actual: temp("chamber", "actual"),
            chamber_temp_target: temp("chamber", "target"),
        })
    }

    async fn get_job(&self) -> PrinterResult<JobProgress> {
        let payload = self.transport.get_json("/api/job", &[]).await?;
        Ok(JobProgress {
            file_name: json_path(&payload, &["job", "file", "name"])
                .and_then(Value::as_str)
                .map(str::to_string),
            completion: json_path(&payload, &["progress", "completion"]).and_then(Value::as_f64),
            print_time_seconds: json_path(&payload, &["progress", "printTime"])
                .and_then(Value::as_i64),
            print_time_left_seconds: json_path(&payload, &["progress", "printTimeLeft"])
                .and_then(Value::as_i64),
        })
    }

    async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
        let payload = self.transport.get_json("/api/files/local", &[]).await?;
        let mut out = Vec::new();
        collect_octoprint_files(
            json_path(&payload, &["files"]).and_then(Value::as_array),
            &mut out,
        );
        Ok(out)
    }

    async fn upload_file(&self, local_path: &Path) -> PrinterResult<UploadResult> {
        let bytes = tokio::fs::read(local_path).await.map_err(|err| {
            PrinterError::File(format!(
                "local file not found or unreadable: {}: {err}",
                local_path.display()
            ))
        })?;
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.gcode")
            .to_string();

        let filename_form = filename.clone();
        let response = self
            .transport
            .send_with_retry("/api/files/local", move |client| {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(filename_form.clone());
                let form = reqwest::multipart::Form::new().part("file", part);
                client
                    .post(format!("{}/api/files/local", self.transport.base()))
                    .multipart(form)
            })
            .await?;

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let uploaded_name = json_path(&body, &["files", "local", "name"])
            .and_then(Value::as_str)
            .unwrap_or(&filename)
            .to_string();

        Ok(UploadResult {
            success: true,
            file_name: uploaded_name.clone(),
            message: format!("Uploaded {uploaded_name} to OctoPrint."),
        })
    }

    async fn delete_file(&self, remote_path: &str) -> PrinterResult<bool> {
        self.transport
            .delete(&format!("/api/files/local/{remote_path}"))
            .await?;
        Ok(true)
    }

    async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult> {
        self.transport
            .post(
                &format!("/api/files/local/{file_name}"),
                Some(&json!({"command": "select", "print": true})),
                &[],
            )
            .await?;
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    async fn cancel_print(&self) -> PrinterResult<PrintResult> {
        self.transport
            .post("/api/job", Some(&json!({"command": "cancel"})), &[])
            .await?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    async fn pause_print(&self) -> PrinterResult<PrintResult> {
        self.transport
            .post(
                "/api/job",
                Some(&json!({"command": "pause", "action": "pause"})),
                &[],
            )
            .await?;
        Ok(PrintResult::ok("Print paused."))
    }

    async fn resume_print(&self) -> PrinterResult<PrintResult> {
        self.transport
            .post(
                "/api/job",
                Some(&json!({"command": "pause", "action": "resume"})),
                &[],
            )
            .await?;
        Ok(PrintResult::ok("Print resumed."))
    }

    async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
        self.send_gcode(&["M112".to_string()]).await?;
        Ok(PrintResult::ok("Emergency stop (M112) sent."))
    }

    async fn set_tool_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 300.0, Heater::Hotend, self.safety_profile().as_deref())?;
        self.transport
            .post(
                "/api/printer/tool",
                Some(&json!({"command": "target", "targets": {"tool0": target_c}})),
                &[],
            )
            .await?;
        Ok(true)
    }

    async fn set_bed_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 120.0, Heater::Bed, self.safety_profile().as_deref())?;
        self.transport
            .post(
                "/api/printer/bed",
                Some(&json!({"command": "target", "target": target_c})),
                &[],
            )
            .await?;
        Ok(true)
    }

    async fn send_gcode(&self, commands: &[String]) -> PrinterResult<bool> {
        // OctoPrint accepts a multi-command batch in one POST.
        self.transport
            .post(
                "/api/printer/command",
                Some(&json!({"commands": commands})),
                &[],
            )
            .await?;
        Ok(true)
    }

    async fn get_snapshot(&self) -> PrinterResult<Option<Vec<u8>>> {
        match self.transport.get_bytes("/webcam/?action=snapshot").await {
            Ok(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
            Ok(_) => Ok(None),
            Err(PrinterError::Http { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn get_stream_url(&self) -> Option<String> {
        Some(format!("{}/webcam/?action=stream", self.transport.base()))
    }

    async fn firmware_resume_print(
        &self,
        params: FirmwareResumeParams,
    ) -> PrinterResult<PrintResult> {
        validate_resume_params(&params)?;
        let commands = build_resume_sequence(&params);
        self.send_gcode(&commands).await?;

        let message = match params.layer_number {
            Some(layer) => format!(
                "Resumed {} at Z={} (layer {layer})",
                params.file_name, params.z_height_mm
            ),
            None => format!("Resumed {} at Z={}", params.file_name, params.z_height_mm),
        };
        Ok(PrintResult::ok(message))
    }
}

fn collect_octoprint_files(entries: Option<&Vec<Value>>, out: &mut Vec<PrinterFile>) {
    let Some(entries) = entries else {
        return;
    };
    for entry in entries {
        if entry.get("type").and_then(Value::as_str) == Some("folder") {
            collect_octoprint_files(entry.get("children").and_then(Value::as_array), out);
            continue;
        }
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        let path = entry.get("path").and_then(Value::as_str).unwrap_or(name);
        let mut file = PrinterFile::new(name, path);
        file.size_bytes = entry.get("size").and_then(Value::as_u64);
        file.date = entry.get("date").and_then(Value::as_i64);
        out.push(file);
    }
}
