//! Print job queue with a persisted per-job state machine.
//!
//! The queue is an in-memory priority structure keyed by
//! `(priority desc, created_at asc)` with a per-id index. All transitions
//! are atomic under the queue lock; `mark_starting` is the race-safe claim
//! operation — exactly one caller wins per job. Terminal transitions are
//! mirrored to the durable store before the caller observes success.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use kiln_events::{Event, EventBus, EventType};
use kiln_store::{JobRecord, KilnDb};

use crate::{now_ts, EngineError, EngineResult};

/// Lifecycle state of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Starting,
    Printing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Starting => "starting",
            JobStatus::Printing => "printing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "starting" => Some(JobStatus::Starting),
            "printing" => Some(JobStatus::Printing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One print job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: String,
    pub file_name: String,
    pub printer_name: Option<String>,
    pub status: JobStatus,
    pub priority: i64,
    pub submitted_by: String,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PrintJob {
    /// Seconds between start and completion (or now, while running).
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(now_ts);
        Some(end - started)
    }

    /// Seconds the job waited (or has been waiting) in the queue.
    pub fn wait_seconds(&self) -> f64 {
        let end = self.started_at.unwrap_or_else(now_ts);
        end - self.created_at
    }

    fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            printer_name: self.printer_name.clone(),
            status: self.status.as_str().to_string(),
            priority: self.priority,
            submitted_by: self.submitted_by.clone(),
            submitted_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Parameters for submitting a job.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub file_name: String,
    pub printer_name: Option<String>,
    pub submitted_by: Option<String>,
    pub priority: i64,
    pub metadata: Map<String, Value>,
}

impl JobRequest {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }
}

/// Thread-safe print job queue.
pub struct PrintQueue {
    jobs: Mutex<HashMap<String, PrintJob>>,
    db: Option<Arc<KilnDb>>,
    bus: Option<Arc<EventBus>>,
}

impl PrintQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            db: None,
            bus: None,
        }
    }

    pub fn with_collaborators(db: Option<Arc<KilnDb>>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            db,
            bus,
        }
    }

    /// Reload non-terminal rows from the store as `queued`. Jobs that were
    /// `starting`/`printing` at crash time are lost-in-flight and must
    /// restart from the beginning.
    pub fn recover_from_store(&self) -> EngineResult<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let rows = db.non_terminal_jobs()?;
        let mut recovered = 0;
        let mut jobs = self.jobs.lock();
        for row in rows {
            let was_in_flight = row.status != "queued";
            let job = PrintJob {
                id: row.id.clone(),
                file_name: row.file_name,
                printer_name: row.printer_name,
                status: JobStatus::Queued,
                priority: row.priority,
                submitted_by: row.submitted_by,
                created_at: row.submitted_at,
                started_at: None,
                completed_at: None,
                error: None,
                metadata: row.metadata,
            };
            if was_in_flight {
                tracing::warn!(job_id = %job.id, "job was in flight at shutdown, requeued");
            }
            db.save_job(&job.to_record())?;
            jobs.insert(job.id.clone(), job);
            recovered += 1;
        }
        Ok(recovered)
    }

    fn persist(&self, job: &PrintJob) -> EngineResult<()> {
        if let Some(db) = &self.db {
            db.save_job(&job.to_record())?;
        }
        Ok(())
    }

    fn emit(&self, event_type: EventType, job: &PrintJob) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(
                event_type,
                json!({
                    "job_id": job.id,
                    "file_name": job.file_name,
                    "printer_name": job.printer_name,
                    "status": job.status.as_str(),
                }),
                "queue",
            ));
        }
    }

    /// Submit a job; returns its id.
    pub fn submit(&self, request: JobRequest) -> EngineResult<String> {
        if request.file_name.is_empty() {
            return Err(EngineError::Validation("file_name must not be empty".into()));
        }
        let id: String = Uuid::new_v4().simple().to_string()[..12].to_string();
        let job = PrintJob {
            id: id.clone(),
            file_name: request.file_name,
            printer_name: request.printer_name,
            status: JobStatus::Queued,
            priority: request.priority,
            submitted_by: request.submitted_by.unwrap_or_else(|| "unknown".to_string()),
            created_at: now_ts(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata: request.metadata,
        };

        self.persist(&job)?;
        self.jobs.lock().insert(id.clone(), job.clone());
        self.emit(EventType::JobQueued, &job);
        Ok(id)
    }

    /// Fetch a copy of a job.
    pub fn get_job(&self, job_id: &str) -> EngineResult<PrintJob> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    fn transition<F>(&self, job_id: &str, apply: F) -> EngineResult<PrintJob>
    where
        F: FnOnce(&mut PrintJob) -> EngineResult<Option<EventType>>,
    {
        let (job, event) = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            let event = apply(job)?;
            (job.clone(), event)
        };
        // Persist before the caller observes success.
        self.persist(&job)?;
        if let Some(event_type) = event {
            self.emit(event_type, &job);
        }
        Ok(job)
    }

    /// Claim a queued job. Exactly one concurrent caller wins; the rest
    /// get `InvalidStateTransition`.
    pub fn mark_starting(&self, job_id: &str) -> EngineResult<PrintJob> {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Queued {
                return Err(EngineError::InvalidStateTransition {
                    job_id: job.id.clone(),
                    detail: format!("cannot start from {}", job.status),
                });
            }
            job.status = JobStatus::Starting;
            job.started_at.get_or_insert_with(now_ts);
            Ok(Some(EventType::JobStarted))
        })
    }

    /// Move a job to `printing`. Tolerates a skipped `mark_starting`,
    /// stamping `started_at` lazily.
    pub fn mark_printing(&self, job_id: &str) -> EngineResult<PrintJob> {
        self.transition(job_id, |job| {
            match job.status {
                JobStatus::Starting => {}
                JobStatus::Queued => {
                    tracing::warn!(
                        job_id = %job.id,
                        "mark_printing without prior mark_starting; claiming implicitly"
                    );
                }
                other => {
                    return Err(EngineError::InvalidStateTransition {
                        job_id: job.id.clone(),
                        detail: format!("cannot move to printing from {other}"),
                    });
                }
            }
            job.status = JobStatus::Printing;
            job.started_at.get_or_insert_with(now_ts);
            Ok(None)
        })
    }

    /// Terminal success. Accepted from `starting` or `printing`.
    pub fn mark_completed(&self, job_id: &str) -> EngineResult<PrintJob> {
        self.transition(job_id, |job| {
            if !matches!(job.status, JobStatus::Starting | JobStatus::Printing) {
                return Err(EngineError::InvalidStateTransition {
                    job_id: job.id.clone(),
                    detail: format!("cannot complete from {}", job.status),
                });
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(now_ts());
            Ok(Some(EventType::JobCompleted))
        })
    }

    /// Terminal failure with an error message.
    pub fn mark_failed(&self, job_id: &str, error: &str) -> EngineResult<PrintJob> {
        self.transition(job_id, |job| {
            if !matches!(job.status, JobStatus::Starting | JobStatus::Printing) {
                return Err(EngineError::InvalidStateTransition {
                    job_id: job.id.clone(),
                    detail: format!("cannot fail from {}", job.status),
                });
            }
            job.status = JobStatus::Failed;
            job.completed_at = Some(now_ts());
            job.error = Some(error.to_string());
            Ok(Some(EventType::JobFailed))
        })
    }

    /// Cancel a job at any non-terminal state. A second cancel (or a
    /// cancel of any terminal job) fails rather than silently succeeding.
    pub fn cancel(&self, job_id: &str) -> EngineResult<PrintJob> {
        self.transition(job_id, |job| {
            if job.status.is_terminal() {
                return Err(EngineError::InvalidStateTransition {
                    job_id: job.id.clone(),
                    detail: format!("already {}", job.status),
                });
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now_ts());
            Ok(Some(EventType::JobCancelled))
        })
    }

    /// The highest-ranked queued job runnable on `printer_name` (or on any
    /// printer). Does not mutate; selection is deterministic given ties.
    pub fn next_job(&self, printer_name: Option<&str>) -> Option<PrintJob> {
        let jobs = self.jobs.lock();
        jobs.values()
            .filter(|job| job.status == JobStatus::Queued)
            .filter(|job| match (&job.printer_name, printer_name) {
                (None, _) => true,
                (Some(assigned), Some(target)) => assigned == target,
                (Some(_), None) => false,
            })
            .min_by(|a, b| {
                (b.priority, a.created_at, &a.id)
                    .partial_cmp(&(a.priority, b.created_at, &b.id))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Jobs ordered by `(priority desc, created_at asc)`, optionally
    /// filtered by status and printer.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        printer_name: Option<&str>,
        limit: usize,
    ) -> Vec<PrintJob> {
        let jobs = self.jobs.lock();
        let mut out: Vec<PrintJob> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .filter(|job| printer_name.map_or(true, |p| job.printer_name.as_deref() == Some(p)))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (b.priority, a.created_at, &a.id)
                .partial_cmp(&(a.priority, b.created_at, &b.id))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(limit);
        out
    }

    /// Number of queued jobs.
    pub fn pending_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    /// Number of starting + printing jobs.
    pub fn active_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|j| matches!(j.status, JobStatus::Starting | JobStatus::Printing))
            .count()
    }

    /// Total number of jobs ever submitted to this queue instance.
    pub fn total_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Snapshot of status → count, omitting empty statuses.
    pub fn summary(&self) -> HashMap<String, usize> {
        let jobs = self.jobs.lock();
        let mut out: HashMap<String, usize> = HashMap::new();
        for job in jobs.values() {
            *out.entry(job.status.as_str().to_string()).or_default() += 1;
        }
        out
    }
}

impl Default for PrintQueue {
    fn default() -> Self {
        Self::new()
    }
}
