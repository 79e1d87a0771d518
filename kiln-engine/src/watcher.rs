//! Vision watchers: long-lived background tasks observing one printer for
//! the duration of a print.
//!
//! Each tick polls `(state, job_progress)`, optionally captures a webcam
//! snapshot, classifies the print phase from the completion percentage and
//! emits a vision.check event. Watcher failures never crash the process;
//! the loop absorbs adapter errors and keeps polling until a terminal
//! condition or its timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use kiln_events::{Event, EventBus, EventType};
use kiln_printers::{PrinterAdapter, PrinterStatus};

use crate::{now_ts, EngineError, EngineResult};

/// Terminal (or live) disposition of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOutcome {
    Running,
    Completed,
    NoActivePrint,
    Paused,
    Failed,
    Timeout,
    Stopped,
}

impl WatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchOutcome::Running => "running",
            WatchOutcome::Completed => "completed",
            WatchOutcome::NoActivePrint => "no_active_print",
            WatchOutcome::Paused => "paused",
            WatchOutcome::Failed => "failed",
            WatchOutcome::Timeout => "timeout",
            WatchOutcome::Stopped => "stopped",
        }
    }
}

/// Classify the print phase from a completion percentage.
pub fn detect_phase(completion: Option<f64>) -> &'static str {
    match completion {
        None => "unknown",
        Some(pct) if pct < 0.0 => "unknown",
        Some(pct) if pct < 10.0 => "first_layers",
        Some(pct) if pct <= 90.0 => "mid_print",
        Some(_) => "final_layers",
    }
}

/// Failure modes worth watching for in each phase.
pub fn phase_hints(phase: &str) -> &'static [&'static str] {
    match phase {
        "first_layers" => &[
            "bed adhesion failure: part detached or corners lifting",
            "nozzle dragging through the first layer",
            "elephant foot from an over-squished first layer",
        ],
        "mid_print" => &[
            "spaghetti: extrusion into air after part detachment",
            "layer shift from a skipped stepper",
            "under-extrusion or a clogged nozzle",
        ],
        "final_layers" => &[
            "insufficient cooling causing drooped top surfaces",
            "stringing between final features",
        ],
        _ => &["no active print detected or progress unknown"],
    }
}

/// Tunables for one watch.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval_s: f64,
    pub timeout_s: f64,
    pub max_snapshots: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 10.0,
            timeout_s: 1800.0,
            max_snapshots: 20,
        }
    }
}

/// Final result captured when a watch terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResult {
    pub watch_id: String,
    pub printer_name: String,
    pub outcome: WatchOutcome,
    pub elapsed_seconds: f64,
    pub progress_log: Vec<Value>,
    pub snapshots_collected: usize,
    pub snapshot_failures: usize,
}

/// Live status snapshot of a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub watch_id: String,
    pub printer_name: String,
    pub outcome: WatchOutcome,
    pub finished: bool,
    pub elapsed_seconds: f64,
    pub progress_entries: usize,
    pub snapshots_collected: usize,
    pub snapshot_failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WatchResult>,
}

struct WatchState {
    started_at: f64,
    progress_log: Vec<Value>,
    snapshots: Vec<Value>,
    snapshot_failures: usize,
    last_completion: Option<f64>,
    first_poll_done: bool,
    result: Option<WatchResult>,
}

/// A background task bound to one printer and one watch id.
pub struct PrintWatcher {
    watch_id: String,
    printer_name: String,
    adapter: Arc<dyn PrinterAdapter>,
    config: WatchConfig,
    bus: Option<Arc<EventBus>>,
    state: Mutex<WatchState>,
    stop_flag: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PrintWatcher {
    fn new(
        watch_id: String,
        printer_name: String,
        adapter: Arc<dyn PrinterAdapter>,
        config: WatchConfig,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            watch_id,
            printer_name,
            adapter,
            config,
            bus,
            state: Mutex::new(WatchState {
                started_at: now_ts(),
                progress_log: Vec::new(),
                snapshots: Vec::new(),
                snapshot_failures: 0,
                last_completion: None,
                first_poll_done: false,
                result: None,
            }),
            stop_flag: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn watch_id(&self) -> &str {
        &self.watch_id
    }

    pub fn printer_name(&self) -> &str {
        &self.printer_name
    }

    fn finish(&self, outcome: WatchOutcome) {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return;
        }
        let result = WatchResult {
            watch_id: self.watch_id.clone(),
            printer_name: self.printer_name.clone(),
            outcome,
            elapsed_seconds: now_ts() - state.started_at,
            progress_log: state.progress_log.clone(),
            snapshots_collected: state.snapshots.len(),
            snapshot_failures: state.snapshot_failures,
        };
        state.result = Some(result);
    }

    /// One poll of the printer. Returns the terminal outcome, if reached.
    async fn tick(&self) -> Option<WatchOutcome> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Some(WatchOutcome::Stopped);
        }
        {
            let state = self.state.lock();
            if now_ts() - state.started_at >= self.config.timeout_s {
                return Some(WatchOutcome::Timeout);
            }
        }

        let printer_state = match self.adapter.get_state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(watch_id = %self.watch_id, error = %err, "watcher state poll failed");
                return None;
            }
        };
        let job = self.adapter.get_job().await.unwrap_or_default();

        let phase = detect_phase(job.completion);
        let entry = json!({
            "ts": now_ts(),
            "status": printer_state.status.as_str(),
            "completion": job.completion,
            "file_name": job.file_name,
            "phase": phase,
        });

        let first_poll;
        let last_completion;
        {
            let mut state = self.state.lock();
            first_poll = !state.first_poll_done;
            state.first_poll_done = true;
            if job.completion.is_some() {
                state.last_completion = job.completion;
            }
            last_completion = state.last_completion;
            state.progress_log.push(entry.clone());
        }

        if self.adapter.capabilities().can_snapshot {
            match self.adapter.get_snapshot().await {
                Ok(Some(bytes)) => {
                    let mut state = self.state.lock();
                    state.snapshots.push(json!({"ts": now_ts(), "size_bytes": bytes.len()}));
                    let overflow = state.snapshots.len().saturating_sub(self.config.max_snapshots);
                    if overflow > 0 {
                        state.snapshots.drain(..overflow);
                    }
                }
                Ok(None) => {}
                Err(_) => {
                    self.state.lock().snapshot_failures += 1;
                }
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(
                EventType::VisionCheck,
                json!({
                    "watch_id": self.watch_id,
                    "printer_name": self.printer_name,
                    "completion": job.completion,
                    "phase": phase,
                    "hints": phase_hints(phase),
                    "progress": entry,
                }),
                "vision",
            ));
        }

        match printer_state.status {
            PrinterStatus::Idle => {
                if first_poll && job.completion.is_none() {
                    Some(WatchOutcome::NoActivePrint)
                } else if last_completion.is_some_and(|c| c >= 99.0) {
                    Some(WatchOutcome::Completed)
                } else if last_completion.is_none() {
                    Some(WatchOutcome::NoActivePrint)
                } else {
                    // The printer went idle without finishing.
                    Some(WatchOutcome::Stopped)
                }
            }
            PrinterStatus::Paused => Some(WatchOutcome::Paused),
            PrinterStatus::Error => Some(WatchOutcome::Failed),
            _ => None,
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.tick().await {
                Some(outcome) => {
                    self.finish(outcome);
                    break;
                }
                None => {
                    tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval_s)).await;
                }
            }
        }
    }

    /// Live status, including the final result once finished.
    pub fn status(&self) -> WatcherStatus {
        let state = self.state.lock();
        let (outcome, finished) = match &state.result {
            Some(result) => (result.outcome, true),
            None => (WatchOutcome::Running, false),
        };
        WatcherStatus {
            watch_id: self.watch_id.clone(),
            printer_name: self.printer_name.clone(),
            outcome,
            finished,
            elapsed_seconds: now_ts() - state.started_at,
            progress_entries: state.progress_log.len(),
            snapshots_collected: state.snapshots.len(),
            snapshot_failures: state.snapshot_failures,
            result: state.result.clone(),
        }
    }

    /// Request an external stop and wait for the loop to finish.
    pub async fn stop(&self) -> WatchResult {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = { self.handle.lock().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // If the loop never got a chance to observe the flag, capture the
        // result here.
        self.finish(WatchOutcome::Stopped);
        let state = self.state.lock();
        state.result.clone().unwrap_or(WatchResult {
            watch_id: self.watch_id.clone(),
            printer_name: self.printer_name.clone(),
            outcome: WatchOutcome::Stopped,
            elapsed_seconds: now_ts() - state.started_at,
            progress_log: state.progress_log.clone(),
            snapshots_collected: state.snapshots.len(),
            snapshot_failures: state.snapshot_failures,
        })
    }
}

/// Process-wide map of live and finished watchers, keyed by watch id.
pub struct WatcherRegistry {
    watchers: DashMap<String, Arc<PrintWatcher>>,
    bus: Option<Arc<EventBus>>,
}

impl WatcherRegistry {
    pub fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            watchers: DashMap::new(),
            bus,
        }
    }

    /// Spawn a watcher for one printer; returns its watch id.
    pub fn start_watch(
        &self,
        printer_name: &str,
        adapter: Arc<dyn PrinterAdapter>,
        config: WatchConfig,
    ) -> String {
        let watch_id = format!("watch-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let watcher = Arc::new(PrintWatcher::new(
            watch_id.clone(),
            printer_name.to_string(),
            adapter,
            config,
            self.bus.clone(),
        ));
        let handle = tokio::spawn(watcher.clone().run());
        *watcher.handle.lock() = Some(handle);
        self.watchers.insert(watch_id.clone(), watcher);
        watch_id
    }

    /// Status of a live or finished watcher.
    pub fn status(&self, watch_id: &str) -> EngineResult<WatcherStatus> {
        self.watchers
            .get(watch_id)
            .map(|w| w.status())
            .ok_or_else(|| EngineError::JobNotFound(format!("watch {watch_id}")))
    }

    /// Stop a watcher and remove it from the map, returning the final
    /// result (finished watchers return theirs unchanged).
    pub async fn stop(&self, watch_id: &str) -> EngineResult<WatchResult> {
        let (_, watcher) = self
            .watchers
            .remove(watch_id)
            .ok_or_else(|| EngineError::JobNotFound(format!("watch {watch_id}")))?;
        Ok(watcher.stop().await)
    }

    /// Ids of all registered watchers.
    pub fn list(&self) -> Vec<String> {
        self.watchers.iter().map(|e| e.key().clone()).collect()
    }
}
