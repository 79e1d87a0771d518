//! Prusa Link adapter (MK4 / XL / MINI local HTTP API).
//!
//! Prusa Link exposes two storage roots — `usb` and `local` — and file
//! operations must fall back between them. File identifiers are the 8.3
//! short names returned by listings, not display names; a 409 on a file
//! endpoint almost always means a long name was used, so the error carries
//! that hint.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::adapter::PrinterAdapter;
use crate::http::{json_path, HttpTransport, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::profiles::{validate_temp, Heater};
use crate::types::{
    JobProgress, PrintResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus,
    UploadResult,
};
use crate::{PrinterError, PrinterResult};

const STORAGE_ROOTS: [&str; 2] = ["usb", "local"];

fn map_prusa_state(state: &str) -> PrinterStatus {
    match state.to_ascii_lowercase().as_str() {
        "idle" | "ready" | "finished" | "stopped" => PrinterStatus::Idle,
        "printing" => PrinterStatus::Printing,
        "paused" => PrinterStatus::Paused,
        "error" | "attention" => PrinterStatus::Error,
        "busy" => PrinterStatus::Busy,
        _ => PrinterStatus::Unknown,
    }
}

/// Rewrap a 409 from a file endpoint with the 8.3 short-name hint.
fn with_short_name_hint(err: PrinterError) -> PrinterError {
    match err {
        PrinterError::Http { status: 409, message } => PrinterError::Http {
            status: 409,
            message: format!(
                "{message} (Prusa Link file endpoints require the 8.3 short name \
                 exactly as returned by the file listing, not the display name)"
            ),
        },
        other => other,
    }
}

/// Concrete adapter backed by the Prusa Link HTTP API.
pub struct PrusaLinkAdapter {
    transport: HttpTransport,
    safety_profile: Mutex<Option<String>>,
}

impl PrusaLinkAdapter {
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
            transport: HttpTransport::new("prusalink", host, Some(api_key), timeout_secs, retries)?,
            safety_profile: Mutex::new(None),
        })
    }

    async fn current_job_id(&self) -> PrinterResult<Option<i64>> {
        let payload = self.transport.get_json("/api/v1/job", &[]).await?;
        Ok(payload.get("id").and_then(Value::as_i64))
    }

    async fn put_file_to_root(&self, root: &str, filename: &str, bytes: Vec<u8>) -> PrinterResult<()> {
        let path = format!("/api/v1/files/{root}/{filename}");
        let url = self.transport.url(&path);
        self.transport
            .send_with_retry(&path, move |client| {
                client
                    .put(url.clone())
                    .header("Content-Type", "application/octet-stream")
                    .body(bytes.clone())
            })
            .await
            .map(|_| ())
            .map_err(with_short_name_hint)
    }

    async fn start_print_at_root(&self, root: &str, name: &str) -> PrinterResult<()> {
        self.transport
            .post(&format!("/api/v1/files/{root}/{name}"), None, &[])
            .await
            .map(|_| ())
            .map_err(with_short_name_hint)
    }
}

/// A 404 means "not in this storage root, try the next one"; anything else
/// aborts the fallback chain.
fn is_root_miss(err: &PrinterError) -> bool {
    matches!(err, PrinterError::Http { status: 404, .. })
}

#[async_trait]
impl PrinterAdapter for PrusaLinkAdapter {
    fn name(&self) -> &str {
        "prusalink"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            // Prusa Link has no raw G-code console over HTTP.
            can_send_gcode: false,
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
        let payload = match self.transport.get_json("/api/v1/status", &[]).await {
            Ok(payload) => payload,
            Err(err) if err.is_transient() => return Ok(PrinterState::offline()),
            Err(err) => return Err(err),
        };

        let printer = json_path(&payload, &["printer"]).cloned().unwrap_or(Value::Null);
        let status = printer
            .get("state")
            .and_then(Value::as_str)
            .map(map_prusa_state)
            .unwrap_or(PrinterStatus::Unknown);

        Ok(PrinterState {
            connected: true,
            status,
            tool_temp_actual: printer.get("temp_nozzle").and_then(Value::as_f64),
            tool_temp_target: printer.get("target_nozzle").and_then(Value::as_f64),
            bed_temp_actual: printer.get("temp_bed").and_then(Value::as_f64),
            bed_temp_target: printer.get("target_bed").and_then(Value::as_f64),
            chamber_temp_actual: None,
            chamber_temp_target: None,
        })
    }

    async fn get_job(&self) -> PrinterResult<JobProgress> {
        let payload = match self.transport.get_json("/api/v1/job", &[]).await {
            Ok(payload) => payload,
            // 204/404: nothing printing.
            Err(PrinterError::Http { status: 404, .. }) => return Ok(JobProgress::idle()),
            Err(err) => return Err(err),
        };

        Ok(JobProgress {
            file_name: json_path(&payload, &["file", "display_name"])
                .or_else(|| json_path(&payload, &["file", "name"]))
                .and_then(Value::as_str)
                .map(str::to_string),
            completion: payload.get("progress").and_then(Value::as_f64),
            print_time_seconds: payload.get("time_printing").and_then(Value::as_i64),
            print_time_left_seconds: payload.get("time_remaining").and_then(Value::as_i64),
        })
    }

    async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
        let mut files = Vec::new();
        let mut any_root_answered = false;

        for root in STORAGE_ROOTS {
            let payload = match self
                .transport
                .get_json(&format!("/api/v1/files/{root}"), &[])
                .await
            {
                Ok(payload) => payload,
                Err(PrinterError::Http { status: 404, .. }) => continue,
                Err(err) => return Err(err),
            };
            any_root_answered = true;

            let children = json_path(&payload, &["children"])
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for entry in children {
                // The short name is the canonical identifier on Prusa Link.
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let mut file = PrinterFile::new(name, format!("/{root}/{name}"));
                file.size_bytes = entry.get("size").and_then(Value::as_u64);
                file.date = entry.get("m_timestamp").and_then(Value::as_i64);
                files.push(file);
            }
        }

        if !any_root_answered {
            return Err(PrinterError::Unreachable {
                message: "neither usb nor local storage answered the file listing".into(),
                source: None,
            });
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

        let mut last_err: Option<PrinterError> = None;
        for root in STORAGE_ROOTS {
            match self.put_file_to_root(root, &filename, bytes.clone()).await {
                Ok(()) => {
                    return Ok(UploadResult {
                        success: true,
                        // The printer stores an 8.3 short name; the listing
                        // is the source of truth for the name to print with.
                        file_name: filename.clone(),
                        message: format!(
                            "Uploaded {filename} to Prusa Link {root} storage \
                             (check the file listing for the stored short name)."
                        ),
                    });
                }
                Err(err) if is_root_miss(&err) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(PrinterError::Unreachable {
            message: "no Prusa Link storage root accepted the upload".into(),
            source: None,
        }))
    }

    async fn delete_file(&self, remote_path: &str) -> PrinterResult<bool> {
        let trimmed = remote_path.trim_start_matches('/');
        self.transport
            .delete(&format!("/api/v1/files/{trimmed}"))
            .await
            .map_err(with_short_name_hint)?;
        Ok(true)
    }

    async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult> {
        let name = file_name.trim_start_matches('/').to_string();
        // A bare short name is tried under both roots; an explicit
        // `usb/…` or `local/…` path goes straight there.
        if name.starts_with("usb/") || name.starts_with("local/") {
            self.transport
                .post(&format!("/api/v1/files/{name}"), None, &[])
                .await
                .map_err(with_short_name_hint)?;
            return Ok(PrintResult::ok(format!("Started printing {file_name}.")));
        }

        let mut last_err: Option<PrinterError> = None;
        for root in STORAGE_ROOTS {
            match self.start_print_at_root(root, &name).await {
                Ok(()) => return Ok(PrintResult::ok(format!("Started printing {file_name}."))),
                Err(err) if is_root_miss(&err) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(PrinterError::Unreachable {
            message: "no Prusa Link storage root knows this file".into(),
            source: None,
        }))
    }

    async fn cancel_print(&self) -> PrinterResult<PrintResult> {
        let Some(job_id) = self.current_job_id().await? else {
            return Err(PrinterError::Busy("no active job to cancel".into()));
        };
        self.transport.delete(&format!("/api/v1/job/{job_id}")).await?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    async fn pause_print(&self) -> PrinterResult<PrintResult> {
        let Some(job_id) = self.current_job_id().await? else {
            return Err(PrinterError::Busy("no active job to pause".into()));
        };
        let path = format!("/api/v1/job/{job_id}/pause");
        let path_req = path.clone();
        self.transport
            .send_with_retry(&path, move |client| {
                client.put(format!("{}{}", self.transport.base(), path_req))
            })
            .await?;
        Ok(PrintResult::ok("Print paused."))
    }

    async fn resume_print(&self) -> PrinterResult<PrintResult> {
        let Some(job_id) = self.current_job_id().await? else {
            return Err(PrinterError::Busy("no active job to resume".into()));
        };
        let path = format!("/api/v1/job/{job_id}/resume");
        let path_req = path.clone();
        self.transport
            .send_with_retry(&path, move |client| {
                client.put(format!("{}{}", self.transport.base(), path_req))
            })
            .await?;
        Ok(PrintResult::ok("Print resumed."))
    }

    async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
        // Prusa Link exposes no firmware-level halt over HTTP; the closest
        // available action is an immediate job stop.
        let Some(job_id) = self.current_job_id().await? else {
            return Err(PrinterError::Unsupported(
                "prusalink has no firmware halt and no active job to stop".into(),
            ));
        };
        self.transport.delete(&format!("/api/v1/job/{job_id}")).await?;
        Ok(PrintResult::ok(
            "Job stopped (Prusa Link has no firmware-level halt; heaters follow the printer's own shutdown).",
        ))
    }

    async fn set_tool_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 290.0, Heater::Hotend, self.safety_profile().as_deref())?;
        Err(PrinterError::Unsupported(
            "prusalink does not expose a temperature-set endpoint".into(),
        ))
    }

    async fn set_bed_temp(&self, target_c: f64) -> PrinterResult<bool> {
        validate_temp(target_c, 120.0, Heater::Bed, self.safety_profile().as_deref())?;
        Err(PrinterError::Unsupported(
            "prusalink does not expose a temperature-set endpoint".into(),
        ))
    }

    async fn send_gcode(&self, _commands: &[String]) -> PrinterResult<bool> {
        Err(PrinterError::Unsupported(
            "prusalink does not support raw G-code".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> PrusaLinkAdapter {
        PrusaLinkAdapter::with_transport_options(&server.uri(), "key", 5, 1).unwrap()
    }

    #[test]
    fn state_strings_map_to_canonical_status() {
        assert_eq!(map_prusa_state("IDLE"), PrinterStatus::Idle);
        assert_eq!(map_prusa_state("PRINTING"), PrinterStatus::Printing);
        assert_eq!(map_prusa_state("ATTENTION"), PrinterStatus::Error);
        assert_eq!(map_prusa_state("FINISHED"), PrinterStatus::Idle);
        assert_eq!(map_prusa_state("???"), PrinterStatus::Unknown);
    }

    #[tokio::test]
    async fn get_state_reads_v1_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "printer": {
                    "state": "PRINTING",
                    "temp_nozzle": 215.0, "target_nozzle": 215.0,
                    "temp_bed": 60.0, "target_bed": 60.0
                }
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let state = adapter.get_state().await.unwrap();
        assert_eq!(state.status, PrinterStatus::Printing);
        assert_eq!(state.tool_temp_actual, Some(215.0));
    }

    #[tokio::test]
    async fn list_files_merges_usb_and_local_roots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/usb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "children": [{"name": "BENCHY~1.GCO", "size": 1024}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/local"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "children": [{"name": "CUBE~1.GCO"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let files = adapter.list_files().await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["BENCHY~1.GCO", "CUBE~1.GCO"]);
        assert_eq!(files[0].path, "/usb/BENCHY~1.GCO");
    }

    #[tokio::test]
    async fn list_files_tolerates_missing_usb_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/usb"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/local"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "children": [{"name": "PART~1.GCO"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let files = adapter.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn start_print_falls_back_to_local_root() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files/usb/PART~1.GCO"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files/local/PART~1.GCO"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        assert!(adapter.start_print("PART~1.GCO").await.unwrap().success);
    }

    #[tokio::test]
    async fn conflict_on_file_endpoint_carries_short_name_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files/usb/a long display name.gcode"))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let err = adapter
            .start_print("usb/a long display name.gcode")
            .await
            .unwrap_err();
        match err {
            PrinterError::Http { status, message } => {
                assert_eq!(status, 409);
                assert!(message.contains("8.3 short name"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_uses_current_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 42, "progress": 10.0
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/job/42"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        assert!(adapter.cancel_print().await.unwrap().success);
    }

    #[tokio::test]
    async fn gcode_is_unsupported() {
        let server = MockServer::start().await;
        let adapter = adapter_for(&server);
        assert!(!adapter.capabilities().can_send_gcode);
        let err = adapter.send_gcode(&["G28".into()]).await.unwrap_err();
        assert!(matches!(err, PrinterError::Unsupported(_)));
    }
}
