//! Named multi-step workflows composed from the queue, adapters and the
//! safety coordinator.
//!
//! Each pipeline records per-step outcomes so a partial failure is
//! diagnosable from the result alone. Slicing is an external collaborator;
//! pipelines operate on files that are already sliced.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kiln_printers::PrinterRegistry;

use crate::queue::{JobRequest, PrintQueue};
use crate::safety::EmergencyCoordinator;
use crate::EngineResult;

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    pub success: bool,
    pub message: String,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PipelineStep {
    fn ok(name: &str, message: impl Into<String>, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            message: message.into(),
            duration_seconds: started.elapsed().as_secs_f64(),
            data: None,
        }
    }

    fn fail(name: &str, message: impl Into<String>, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            message: message.into(),
            duration_seconds: started.elapsed().as_secs_f64(),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub success: bool,
    pub message: String,
    pub steps: Vec<PipelineStep>,
    pub total_duration_seconds: f64,
}

/// Descriptor for one registered pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [&'static str],
}

/// All registered pipelines.
pub fn list_pipelines() -> Vec<PipelineDescriptor> {
    vec![
        PipelineDescriptor {
            name: "quick_print",
            description: "Preflight → upload → queue → start print in one shot.",
            params: &["gcode_path", "printer_name", "material"],
        },
        PipelineDescriptor {
            name: "calibrate",
            description: "Home → bed level → calibration report.",
            params: &["printer_name"],
        },
        PipelineDescriptor {
            name: "benchmark",
            description: "Upload a reference model and report printer history stats.",
            params: &["gcode_path", "printer_name"],
        },
    ]
}

/// Pipeline runner over shared collaborators.
pub struct Pipelines {
    registry: Arc<PrinterRegistry>,
    queue: Arc<PrintQueue>,
    safety: Arc<EmergencyCoordinator>,
}

impl Pipelines {
    pub fn new(
        registry: Arc<PrinterRegistry>,
        queue: Arc<PrintQueue>,
        safety: Arc<EmergencyCoordinator>,
    ) -> Self {
        Self {
            registry,
            queue,
            safety,
        }
    }

    fn resolve_printer(
        &self,
        printer_name: Option<&str>,
    ) -> Option<(String, Arc<dyn kiln_printers::PrinterAdapter>)> {
        match printer_name {
            Some(name) => self.registry.get(name).map(|a| (name.to_string(), a)),
            None => self.registry.get_default(),
        }
    }

    fn abort(
        pipeline: &str,
        message: String,
        steps: Vec<PipelineStep>,
        started: Instant,
    ) -> PipelineResult {
        PipelineResult {
            pipeline: pipeline.to_string(),
            success: false,
            message,
            steps,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    /// Preflight → upload → queue → start, ending with the job printing.
    pub async fn quick_print(
        &self,
        gcode_path: &Path,
        printer_name: Option<&str>,
        material: Option<&str>,
    ) -> EngineResult<PipelineResult> {
        let started = Instant::now();
        let mut steps = Vec::new();

        let step_start = Instant::now();
        let Some((name, adapter)) = self.resolve_printer(printer_name) else {
            steps.push(PipelineStep::fail("connect", "no printer registered", step_start));
            return Ok(Self::abort("quick_print", "No printer available.".into(), steps, started));
        };
        steps.push(
            PipelineStep::ok("connect", format!("Using printer {name}"), step_start)
                .with_data(json!({"printer_name": name})),
        );

        let step_start = Instant::now();
        match self.safety.preflight(&name, material, None).await {
            Ok(report) => {
                steps.push(
                    PipelineStep::ok("preflight", "All preflight checks passed", step_start)
                        .with_data(json!({"checks": report.checks.len()})),
                );
            }
            Err(err) => {
                steps.push(PipelineStep::fail("preflight", err.to_string(), step_start));
                return Ok(Self::abort(
                    "quick_print",
                    format!("Pipeline failed at preflight: {err}"),
                    steps,
                    started,
                ));
            }
        }

        let step_start = Instant::now();
        let remote_name = match adapter.upload_file(gcode_path).await {
            Ok(result) => {
                steps.push(
                    PipelineStep::ok("upload", result.message.clone(), step_start)
                        .with_data(json!({"remote_name": result.file_name})),
                );
                result.file_name
            }
            Err(err) => {
                steps.push(PipelineStep::fail("upload", err.to_string(), step_start));
                return Ok(Self::abort(
                    "quick_print",
                    format!("Pipeline failed at upload: {err}"),
                    steps,
                    started,
                ));
            }
        };

        let step_start = Instant::now();
        let job_id = self.queue.submit(JobRequest {
            file_name: remote_name.clone(),
            printer_name: Some(name.clone()),
            submitted_by: Some("pipeline:quick_print".into()),
            ..JobRequest::default()
        })?;
        self.queue.mark_starting(&job_id)?;
        steps.push(
            PipelineStep::ok("queue", format!("Job {job_id} claimed"), step_start)
                .with_data(json!({"job_id": job_id})),
        );

        let step_start = Instant::now();
        match adapter.start_print(&remote_name).await {
            Ok(result) => {
                self.queue.mark_printing(&job_id)?;
                steps.push(PipelineStep::ok("start_print", result.message, step_start));
            }
            Err(err) => {
                self.queue.mark_failed(&job_id, &err.to_string())?;
                steps.push(PipelineStep::fail("start_print", err.to_string(), step_start));
                return Ok(Self::abort(
                    "quick_print",
                    format!("Pipeline failed at start: {err}"),
                    steps,
                    started,
                ));
            }
        }

        Ok(PipelineResult {
            pipeline: "quick_print".into(),
            success: true,
            message: format!("Printing {remote_name} on {name} (job {job_id})."),
            steps,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Home → auto bed level → report. Bed leveling is non-fatal; not every
    /// printer supports G29.
    pub async fn calibrate(&self, printer_name: Option<&str>) -> EngineResult<PipelineResult> {
        let started = Instant::now();
        let mut steps = Vec::new();

        let step_start = Instant::now();
        let Some((name, adapter)) = self.resolve_printer(printer_name) else {
            steps.push(PipelineStep::fail("connect", "no printer registered", step_start));
            return Ok(Self::abort("calibrate", "No printer available.".into(), steps, started));
        };
        let state = adapter.get_state().await?;
        if !state.connected {
            steps.push(PipelineStep::fail("connect", "printer offline", step_start));
            return Ok(Self::abort(
                "calibrate",
                "Printer is not connected.".into(),
                steps,
                started,
            ));
        }
        steps.push(
            PipelineStep::ok("connect", "Connected", step_start)
                .with_data(json!({"status": state.status.as_str()})),
        );

        let step_start = Instant::now();
        match adapter.send_gcode(&["G28".to_string()]).await {
            Ok(_) => steps.push(PipelineStep::ok("home", "Homed all axes (G28)", step_start)),
            Err(err) => {
                steps.push(PipelineStep::fail("home", format!("Homing failed: {err}"), step_start));
                return Ok(Self::abort(
                    "calibrate",
                    format!("Pipeline failed at homing: {err}"),
                    steps,
                    started,
                ));
            }
        }

        let step_start = Instant::now();
        match adapter.send_gcode(&["G29".to_string()]).await {
            Ok(_) => steps.push(PipelineStep::ok(
                "bed_level",
                "Auto bed leveling complete (G29)",
                step_start,
            )),
            // Non-fatal: not all printers probe.
            Err(err) => steps.push(PipelineStep::ok(
                "bed_level",
                format!("Auto bed level not available: {err}"),
                step_start,
            )),
        }

        Ok(PipelineResult {
            pipeline: "calibrate".into(),
            success: true,
            message: format!("Calibration sequence complete on {name}."),
            steps,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Upload a reference model and report queue history for the printer.
    /// Does not start the print — benchmarks should be manually observed.
    pub async fn benchmark(
        &self,
        gcode_path: &Path,
        printer_name: Option<&str>,
    ) -> EngineResult<PipelineResult> {
        let started = Instant::now();
        let mut steps = Vec::new();

        let step_start = Instant::now();
        let Some((name, adapter)) = self.resolve_printer(printer_name) else {
            steps.push(PipelineStep::fail("connect", "no printer registered", step_start));
            return Ok(Self::abort("benchmark", "No printer available.".into(), steps, started));
        };
        steps.push(PipelineStep::ok("connect", format!("Using printer {name}"), step_start));

        let step_start = Instant::now();
        let remote_name = match adapter.upload_file(gcode_path).await {
            Ok(result) => {
                steps.push(
                    PipelineStep::ok("upload", result.message.clone(), step_start)
                        .with_data(json!({"remote_name": result.file_name})),
                );
                result.file_name
            }
            Err(err) => {
                steps.push(PipelineStep::fail("upload", err.to_string(), step_start));
                return Ok(Self::abort(
                    "benchmark",
                    format!("Benchmark failed at upload: {err}"),
                    steps,
                    started,
                ));
            }
        };

        let step_start = Instant::now();
        let history = self.queue.list_jobs(None, Some(&name), 100);
        let completed = history
            .iter()
            .filter(|j| j.status == crate::queue::JobStatus::Completed)
            .count();
        let failed = history
            .iter()
            .filter(|j| j.status == crate::queue::JobStatus::Failed)
            .count();
        steps.push(
            PipelineStep::ok(
                "stats",
                format!("{completed} completed, {failed} failed on {name}"),
                step_start,
            )
            .with_data(json!({"completed": completed, "failed": failed, "total": history.len()})),
        );

        Ok(PipelineResult {
            pipeline: "benchmark".into(),
            success: true,
            message: format!(
                "Benchmark ready: {remote_name} uploaded. Start the print manually to observe quality."
            ),
            steps,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_printers::{
        JobProgress, PrintResult, PrinterAdapter, PrinterCapabilities, PrinterError, PrinterFile,
        PrinterResult, PrinterState, PrinterStatus, UploadResult,
    };

    struct BenchAdapter {
        upload_ok: bool,
    }

    #[async_trait]
    impl PrinterAdapter for BenchAdapter {
        fn name(&self) -> &str {
            "bench"
        }
        fn capabilities(&self) -> PrinterCapabilities {
            PrinterCapabilities::default()
        }
        fn set_safety_profile(&self, _p: &str) {}
        fn safety_profile(&self) -> Option<String> {
            None
        }
        async fn get_state(&self) -> PrinterResult<PrinterState> {
            Ok(PrinterState::connected(PrinterStatus::Idle))
        }
        async fn get_job(&self) -> PrinterResult<JobProgress> {
            Ok(JobProgress::idle())
        }
        async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
            Ok(vec![])
        }
        async fn upload_file(&self, path: &Path) -> PrinterResult<UploadResult> {
            if self.upload_ok {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload.gcode")
                    .to_string();
                Ok(UploadResult {
                    success: true,
                    file_name: name.clone(),
                    message: format!("Uploaded {name}."),
                })
            } else {
                Err(PrinterError::File("disk full".into()))
            }
        }
        async fn delete_file(&self, _p: &str) -> PrinterResult<bool> {
            Ok(true)
        }
        async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok(format!("Started {file_name}.")))
        }
        async fn cancel_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("ok"))
        }
        async fn pause_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("ok"))
        }
        async fn resume_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("ok"))
        }
        async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("ok"))
        }
        async fn set_tool_temp(&self, _t: f64) -> PrinterResult<bool> {
            Ok(true)
        }
        async fn set_bed_temp(&self, _t: f64) -> PrinterResult<bool> {
            Ok(true)
        }
        async fn send_gcode(&self, _c: &[String]) -> PrinterResult<bool> {
            Ok(true)
        }
    }

    fn pipelines(upload_ok: bool) -> (Pipelines, Arc<PrintQueue>) {
        let registry = Arc::new(PrinterRegistry::new());
        registry
            .register("voron", Arc::new(BenchAdapter { upload_ok }), "http://v", None)
            .unwrap();
        let queue = Arc::new(PrintQueue::new());
        let safety = Arc::new(EmergencyCoordinator::new(registry.clone(), None));
        (
            Pipelines::new(registry, queue.clone(), safety),
            queue,
        )
    }

    fn temp_gcode() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchy.gcode");
        std::fs::write(&path, "G28\nG1 X10\n").unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn quick_print_runs_to_printing() {
        let (pipelines, queue) = pipelines(true);
        let (_dir, path) = temp_gcode();
        let result = pipelines.quick_print(&path, Some("voron"), None).await.unwrap();

        assert!(result.success, "{result:?}");
        let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["connect", "preflight", "upload", "queue", "start_print"]);
        assert_eq!(queue.active_count(), 1);
    }

    #[tokio::test]
    async fn quick_print_aborts_on_upload_failure() {
        let (pipelines, queue) = pipelines(false);
        let (_dir, path) = temp_gcode();
        let result = pipelines.quick_print(&path, Some("voron"), None).await.unwrap();

        assert!(!result.success);
        assert!(result.message.contains("upload"));
        // Nothing was queued.
        assert_eq!(queue.total_count(), 0);
    }

    #[tokio::test]
    async fn quick_print_without_printer_fails_cleanly() {
        let registry = Arc::new(PrinterRegistry::new());
        let queue = Arc::new(PrintQueue::new());
        let safety = Arc::new(EmergencyCoordinator::new(registry.clone(), None));
        let pipelines = Pipelines::new(registry, queue, safety);
        let (_dir, path) = temp_gcode();
        let result = pipelines.quick_print(&path, None, None).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn calibrate_homes_and_levels() {
        let (pipelines, _queue) = pipelines(true);
        let result = pipelines.calibrate(Some("voron")).await.unwrap();
        assert!(result.success);
        let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["connect", "home", "bed_level"]);
    }

    #[tokio::test]
    async fn benchmark_uploads_but_does_not_start() {
        let (pipelines, queue) = pipelines(true);
        let (_dir, path) = temp_gcode();
        let result = pipelines.benchmark(&path, Some("voron")).await.unwrap();
        assert!(result.success);
        assert!(result.message.contains("manually"));
        assert_eq!(queue.total_count(), 0);
    }

    #[test]
    fn pipeline_listing_names_all_three() {
        let names: Vec<&str> = list_pipelines().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["quick_print", "calibrate", "benchmark"]);
    }
}
