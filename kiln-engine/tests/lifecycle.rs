//! End-to-end lifecycle tests over the assembled service.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use kiln_engine::queue::{JobRequest, JobStatus};
use kiln_engine::watcher::WatchConfig;
use kiln_engine::KilnService;
use kiln_events::EventType;
use kiln_printers::{
    JobProgress, PrintResult, PrinterAdapter, PrinterCapabilities, PrinterError, PrinterFile,
    PrinterResult, PrinterState, PrinterStatus, UploadResult,
};

/// Adapter simulating an idle printer that finishes whatever it is asked
/// to print on the second poll.
struct SimPrinter {
    polls: std::sync::atomic::AtomicUsize,
}

impl SimPrinter {
    fn new() -> Self {
        Self {
            polls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PrinterAdapter for SimPrinter {
    fn name(&self) -> &str {
        "sim"
    }
    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities::default()
    }
    fn set_safety_profile(&self, _profile_id: &str) {}
    fn safety_profile(&self) -> Option<String> {
        None
    }
    async fn get_state(&self) -> PrinterResult<PrinterState> {
        let poll = self.polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(PrinterState::connected(if poll == 0 {
            PrinterStatus::Printing
        } else {
            PrinterStatus::Idle
        }))
    }
    async fn get_job(&self) -> PrinterResult<JobProgress> {
        let poll = self.polls.load(std::sync::atomic::Ordering::SeqCst);
        Ok(JobProgress {
            file_name: Some("benchy.gcode".into()),
            completion: Some(if poll <= 1 { 55.0 } else { 100.0 }),
            print_time_seconds: Some(1200),
            print_time_left_seconds: Some(900),
        })
    }
    async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
        Ok(vec![PrinterFile::new("benchy.gcode", "benchy.gcode")])
    }
    async fn upload_file(&self, _local_path: &Path) -> PrinterResult<UploadResult> {
        Err(PrinterError::Unsupported("sim".into()))
    }
    async fn delete_file(&self, _remote_path: &str) -> PrinterResult<bool> {
        Ok(true)
    }
    async fn start_print(&self, file_name: &str) -> PrinterResult<PrintResult> {
        Ok(PrintResult::ok(format!("Started {file_name}.")))
    }
    async fn cancel_print(&self) -> PrinterResult<PrintResult> {
        Ok(PrintResult::ok("cancelled"))
    }
    async fn pause_print(&self) -> PrinterResult<PrintResult> {
        Ok(PrintResult::ok("paused"))
    }
    async fn resume_print(&self) -> PrinterResult<PrintResult> {
        Ok(PrintResult::ok("resumed"))
    }
    async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
        Ok(PrintResult::ok("halted"))
    }
    async fn set_tool_temp(&self, _target_c: f64) -> PrinterResult<bool> {
        Ok(true)
    }
    async fn set_bed_temp(&self, _target_c: f64) -> PrinterResult<bool> {
        Ok(true)
    }
    async fn send_gcode(&self, _commands: &[String]) -> PrinterResult<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn submit_claim_print_complete_leaves_one_terminal_row() {
    let service = KilnService::in_memory().unwrap();
    service
        .registry
        .register("voron", Arc::new(SimPrinter::new()), "http://voron.local", None)
        .unwrap();

    let job_id = service
        .queue
        .submit(JobRequest {
            file_name: "benchy.gcode".into(),
            printer_name: Some("voron".into()),
            submitted_by: Some("agent".into()),
            ..JobRequest::default()
        })
        .unwrap();

    // Observable as queued; next_job returns it without mutating.
    assert_eq!(service.queue.get_job(&job_id).unwrap().status, JobStatus::Queued);
    let next = service.queue.next_job(Some("voron")).unwrap();
    assert_eq!(next.id, job_id);
    assert_eq!(service.queue.get_job(&job_id).unwrap().status, JobStatus::Queued);

    // Claim, print, complete.
    service.queue.mark_starting(&job_id).unwrap();
    service.queue.mark_printing(&job_id).unwrap();
    let done = service.queue.mark_completed(&job_id).unwrap();
    assert!(done.completed_at.is_some());

    // Exactly one terminal job event and one persisted terminal row.
    let completed_events = service.bus.recent_events(Some(EventType::JobCompleted), 10);
    assert_eq!(completed_events.len(), 1);
    let row = service.db.get_job(&job_id).unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert!(row.completed_at.is_some());

    // The durable event log saw the whole lifecycle.
    let stored = service.db.recent_events(Some("job.completed"), 10).unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn watcher_observes_print_through_completion() {
    let service = KilnService::in_memory().unwrap();
    service
        .registry
        .register("voron", Arc::new(SimPrinter::new()), "http://voron.local", None)
        .unwrap();

    let response = service.tool_watch_print(
        "voron",
        WatchConfig {
            poll_interval_s: 0.01,
            timeout_s: 5.0,
            max_snapshots: 4,
        },
    );
    assert!(response.success);
    let watch_id = response.data.unwrap()["watch_id"]
        .as_str()
        .unwrap()
        .to_string();

    for _ in 0..500 {
        let status = service.tool_watch_status(&watch_id);
        let data = status.data.unwrap();
        if data["finished"].as_bool().unwrap_or(false) {
            assert_eq!(data["outcome"], "completed");
            // Vision checks were emitted along the way.
            assert!(!service
                .bus
                .recent_events(Some(EventType::VisionCheck), 50)
                .is_empty());
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("watcher never finished");
}

#[tokio::test]
async fn emergency_stop_blocks_preflight_until_cleared() {
    let service = KilnService::in_memory().unwrap();
    service
        .registry
        .register("voron", Arc::new(SimPrinter::new()), "http://voron.local", None)
        .unwrap();

    service
        .safety
        .emergency_stop("voron", kiln_engine::EmergencyReason::UserRequest)
        .await;
    assert!(service.safety.is_stopped("voron"));

    let response = service.tool_preflight("voron", None).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, "PREFLIGHT_FAILED");

    assert!(service.safety.clear_stop("voron"));
    assert!(!service.safety.is_stopped("voron"));
}
