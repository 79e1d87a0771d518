//! Klipper/Moonraker adapter.
//!
//! Talks to the Moonraker HTTP API, the REST front-end for Klipper.
//! Moonraker exposes two relevant state fields: the klippy readiness state
//! from `GET /printer/info` and the job state from `print_stats`. The job
//! state refines a `ready` klippy state — the firmware can be "ready" while
//! a print is running.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::adapter::PrinterAdapter;
use crate::http::{json_path, HttpTransport, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::profiles::{validate_temp, Heater};
use crate::types::{
    JobProgress, PrintResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus,
    UploadResult,
};
use crate::{PrinterError, PrinterResult};

/// Map a Moonraker state string to the canonical status.
fn map_state(state: &str) -> Option<PrinterStatus> {
    match state {
        "ready" | "standby" | "complete" | "cancelled" => Some(PrinterStatus::Idle),
        "printing" => Some(PrinterStatus::Printing),
        "paused" => Some(PrinterStatus::Paused),
        "error" => Some(PrinterStatus::Error),
        "shutdown" => Some(PrinterStatus::Offline),
        "startup" => Some(PrinterStatus::Busy),
        _ => None,
    }
}

/// Combine the klippy state with the finer-grained `print_stats.state`.
fn map_moonraker_state(klippy_state: &str, print_state: Option<&str>) -> PrinterStatus {
    if klippy_state == "ready" {
        if let Some(mapped) = print_state.and_then(map_state) {
            return mapped;
        }
    }
    map_state(klippy_state).unwrap_or(PrinterStatus::Unknown)
}

/// Concrete adapter backed by the Moonraker HTTP API.
pub struct MoonrakerAdapter {
    transport: HttpTransport,
    safety_profile: Mutex<Option<String>>,
}

impl MoonrakerAdapter {
    /// `host` is the Moonraker base URL, e.g. `http://klipper.local:7125`.
    /// Moonraker usually needs no authentication; a key, when given, is
    /// sent as `X-Api-Key`.
    pub fn new(host: &str, api_key: Option<&str>) -> PrinterResult<Self> {
        Self::with_transport_options(host, api_key, DEFAULT_TIMEOUT_SECS, DEFAULT_RETRIES)
    }

    pub fn with_transport_options(
        host: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
        retries: u32,
    ) -> PrinterResult<Self> {
        Ok(Self {
            transport: HttpTransport::new("moonraker", host, api_key, timeout_secs, retries)?,
            safety_profile: Mutex::new(None),
        })
    }

    async fn send_gcode_script(&self, script: &str) -> PrinterResult<()> {
        self.transport
            .post("/printer/gcode/script", None, &[("script", script)])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PrinterAdapter for MoonrakerAdapter {
    fn name(&self) -> &str {
        "moonraker"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_snapshot: true,
            can_probe_bed: true,
            can_detect_filament: true,
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
        let info = match self.transport.get_json("/printer/info", &[]).await {
            Ok(info) => info,
            Err(err) if err.is_transient() => return Ok(PrinterState::offline()),
            Err(err) => return Err(err),
        };

        let klippy_state = json_path(&info, &["result", "state"])
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        // If Klipper itself is not ready, report the high-level state
        // without querying objects (which would likely fail).
        if klippy_state != "ready" {
            return Ok(PrinterState::connected(map_moonraker_state(
                klippy_state,
                None,
            )));
        }

        let objects = match self
            .transport
            .get_json(
                "/printer/objects/query",
                &[("heater_bed", ""), ("extruder", ""), ("print_stats", "")],
            )
            .await
        {
            Ok(objects) => objects,
            // Connected but temps unreadable.
            Err(_) => {
                return Ok(PrinterState::connected(map_moonraker_state(
                    klippy_state,
                    None,
                )))
            }
        };

        let status = json_path(&objects, &["result", "status"]).cloned().unwrap_or(Value::Null);
        let print_state = json_path(&status, &["print_stats", "state"]).and_then(Value::as_str);

        Ok(PrinterState {
            connected: true,
            status: map_moonraker_state(klippy_state, print_state),
            tool_temp_actual: json_path(&status, &["extruder", "temperature"])
                .and_then(Value::as_f64),
            tool_temp_target: json_path(&status, &["extruder", "target"]).and_then(Value::as_f64),
            bed_temp_actual: json_path(&status, &["heater_bed", "temperature"])
                .and_then(Value::as_f64),
            bed_temp_target: json_path(&status, &["heater_bed", "target"]).and_then(Value::as_f64),
            chamber_temp_actual: None,
            chamber_temp_target: None,
        })
    }

    async fn get_job(&self) -> PrinterResult<JobProgress> {
        let payload = self
            .transport
            .get_json(
                "/printer/objects/query",
                &[("print_stats", ""), ("virtual_sdcard", "")],
            )
            .await?;

        let status = json_path(&payload, &["result", "status"]).cloned().unwrap_or(Value::Null);
        let file_name = json_path(&status, &["print_stats", "filename"])
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let print_duration =
            json_path(&status, &["print_stats", "print_duration"]).and_then(Value::as_f64);
        // Moonraker reports progress as 0.0–1.0.
        let completion = json_path(&status, &["virtual_sdcard", "progress"])
            .and_then(Value::as_f64)
            .map(|p| (p * 100.0 * 100.0).round() / 100.0);

        let print_time_seconds = print_duration.map(|d| d as i64);
        let print_time_left_seconds = match (print_time_seconds, completion) {
            (Some(elapsed), Some(pct)) if pct > 0.0 => {
                let total_estimated = elapsed as f64 / (pct / 100.0);
                Some((total_estimated - elapsed as f64).max(0.0) as i64)
            }
            _ => None,
        };

        Ok(JobProgress {
            file_name,
            completion,
            print_time_seconds,
            print_time_left_seconds,
        })
    }

    async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
        let payload = self
            .transport
            .get_json("/server/files/list", &[("root", "gcodes")])
            .await?;

        let raw = json_path(&payload, &["result"])
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut files = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(path) = entry.get("path").and_then(Value::as_str) else {
                continue;
            };
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            let mut file = PrinterFile::new(name, path);
            file.size_bytes = entry.get("size").and_then(Value::as_u64);
            file.date = entry.get("modified").and_then(Value::as_f64).map(|m| m as i64);
            files.push(file);
        }
        Ok(files)
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

        let filename_for_form = filename.clone();
        let response = self
            .transport
            .send_with_retry("/server/files/upload", move |client| {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(filename_for_form.clone())
                    .mime_str("application/octet-stream")
                    .unwrap_or_else(|_| {
                        reqwest::multipart::Part::bytes(bytes.clone())
                            .file_name(filename_for_form.clone())
                    });
                let form = reqwest::multipart::Form::new()
                    .text("root", "gcodes")
                    .part("file", part);
                client
                    .post(format!("{}/server/files/upload", self.transport.base()))
                    .multipart(form)
            })
            .await?;

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let uploaded_name = json_path(&body, &["result", "item", "path"])
            .and_then(Value::as_str)
            .unwrap_or(&filename)
            .to_string();

        Ok(UploadResult {
            success: true,
            file_name: uploaded_name.clone(),
            message: format!("Uploaded {uploaded_name} to Moonraker."),
        })
    }

    async fn delete_file(&self, remote_path: &str) -> PrinterResult<bool> {
        self.transport
            .delete(&format!("/server/files/gcodes/{remote_path}"))
            .await?;
        Ok(true)
    }

    async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult> {
        self.transport
            .post("/printer/print/start", None, &[("filename", file_name)])
            .await?;
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    async fn cancel_print(&self) -> PrinterResult<PrintResult> {
        self.transport.post("/printer/print/cancel", None, &[]).await?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    async fn pause_print(&self) -> PrinterResult<PrintResult> {
        self.transport.post("/printer/print/pause", None, &[]).await?;
        Ok(PrintResult::ok("Print paused."))
    }

    async fn resume_print(&self) -> PrinterResult<PrintResult> {
        self.transport.post("/printer/print/resume", None, &[]).await?;
        Ok(PrintResult::ok("Print resumed."))
    }

    async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
        self.transport
            .post("/printer/emergency_stop", None, &[])
            .await?;
        Ok(PrintResult::ok("Emergency stop issued."))
    }

    async fn set_tool_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 300.0, Heater::Hotend, self.safety_profile().as_deref())?;
        self.send_gcode_script(&format!("M104 S{}", target_c as i64)).await?;
        Ok(true)
    }

    async fn set_bed_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 120.0, Heater::Bed, self.safety_profile().as_deref())?;
        self.send_gcode_script(&format!("M140 S{}", target_c as i64)).await?;
        Ok(true)
    }

    async fn send_gcode(&self, commands: &[String]) -> PrinterResult<bool> {
        self.send_gcode_script(&commands.join("\n")).await?;
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

    async fn get_bed_mesh(&self) -> PrinterResult<Option<Value>> {
        let payload = self
            .transport
            .get_json("/printer/objects/query", &[("bed_mesh", "")])
            .await?;
        Ok(json_path(&payload, &["result", "status", "bed_mesh"]).cloned())
    }

    async fn get_filament_status(&self) -> PrinterResult<Option<Value>> {
        let payload = self
            .transport
            .get_json(
                "/printer/objects/query",
                &[("filament_switch_sensor runout_sensor", "")],
            )
            .await?;
        let sensor = json_path(
            &payload,
            &["result", "status", "filament_switch_sensor runout_sensor"],
        );
        Ok(sensor.map(|s| {
            json!({
                "detected": s.get("filament_detected").and_then(Value::as_bool),
                "sensor_enabled": s.get("enabled").and_then(Value::as_bool),
            })
        }))
    }
}
