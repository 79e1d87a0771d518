//! Typed tool surface for agents and RPC callers.
//!
//! Every operation returns a uniform envelope:
//! `{success, data?, error: {code, message}}` with a machine code from the
//! error taxonomy and a human message. Internal detail stays in the logs,
//! never in the returned message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::queue::{JobRequest, JobStatus};
use crate::router::{PrinterInfo, RoutingCriteria};
use crate::safety::EmergencyReason;
use crate::service::KilnService;
use crate::watcher::WatchConfig;
use crate::{EngineError, EngineResult};

/// Machine-readable error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

/// Uniform tool result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

fn respond<T: Serialize>(result: EngineResult<T>) -> ToolResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => ToolResponse::ok(data),
            Err(err) => {
                tracing::error!(error = %err, "tool response serialization failed");
                ToolResponse::fail("INTERNAL", "internal error")
            }
        },
        Err(err) => {
            let code = err.code();
            if code == "INTERNAL" {
                // Trace breadcrumb in logs; generic message to the caller.
                tracing::error!(error = %err, "tool call failed internally");
                ToolResponse::fail(code, "internal error")
            } else {
                ToolResponse::fail(code, err.to_string())
            }
        }
    }
}

impl KilnService {
    /// Printer state + job progress for one printer (or the default).
    pub async fn tool_printer_status(&self, printer_name: Option<&str>) -> ToolResponse {
        let resolved = match printer_name {
            Some(name) => self.registry.get(name).map(|a| (name.to_string(), a)),
            None => self.registry.get_default(),
        };
        let Some((name, adapter)) = resolved else {
            return ToolResponse::fail("NOT_FOUND", "no matching printer registered");
        };
        let result: EngineResult<Value> = async {
            let state = adapter.get_state().await?;
            let job = adapter.get_job().await?;
            Ok(json!({
                "printer_name": name,
                "state": state,
                "job": job,
                "capabilities": adapter.capabilities(),
            }))
        }
        .await;
        respond(result)
    }

    /// Submit a job to the queue.
    pub fn tool_submit_job(&self, request: JobRequest) -> ToolResponse {
        respond(self.queue.submit(request).map(|job_id| json!({"job_id": job_id})))
    }

    /// Cancel a queued or running job.
    pub fn tool_cancel_job(&self, job_id: &str) -> ToolResponse {
        respond(self.queue.cancel(job_id))
    }

    /// Queue counters and per-status breakdown.
    pub fn tool_queue_summary(&self) -> ToolResponse {
        ToolResponse::ok(json!({
            "pending": self.queue.pending_count(),
            "active": self.queue.active_count(),
            "total": self.queue.total_count(),
            "summary": self.queue.summary(),
        }))
    }

    /// Job history, optionally filtered by status.
    pub fn tool_job_history(&self, status: Option<&str>, limit: usize) -> ToolResponse {
        let status = match status {
            Some(s) => match JobStatus::parse(s) {
                Some(parsed) => Some(parsed),
                None => {
                    return ToolResponse::fail("VALIDATION", format!("unknown status {s:?}"))
                }
            },
            None => None,
        };
        ToolResponse::ok(json!({"jobs": self.queue.list_jobs(status, None, limit)}))
    }

    /// Score candidates and recommend a printer.
    pub fn tool_route_job(
        &self,
        criteria: &RoutingCriteria,
        printers: &[PrinterInfo],
    ) -> ToolResponse {
        respond(self.router.route_job(criteria, printers))
    }

    /// Run preflight checks without mutating anything.
    pub async fn tool_preflight(
        &self,
        printer_name: &str,
        material: Option<&str>,
    ) -> ToolResponse {
        respond(self.safety.preflight(printer_name, material, None).await)
    }

    /// Immediate single-printer stop.
    pub async fn tool_emergency_stop(
        &self,
        printer_name: &str,
        reason: EmergencyReason,
    ) -> ToolResponse {
        let record = self.safety.emergency_stop(printer_name, reason).await;
        respond(Ok::<_, EngineError>(record))
    }

    /// Immediate fleet-wide stop.
    pub async fn tool_emergency_stop_all(&self, reason: EmergencyReason) -> ToolResponse {
        let records = self.safety.emergency_stop_all(reason).await;
        respond(Ok::<_, EngineError>(json!({"stopped": records})))
    }

    /// Start a background watcher on a printer.
    pub fn tool_watch_print(&self, printer_name: &str, config: WatchConfig) -> ToolResponse {
        let Some(adapter) = self.registry.get(printer_name) else {
            return ToolResponse::fail("NOT_FOUND", format!("printer {printer_name:?} not registered"));
        };
        let watch_id = self.watchers.start_watch(printer_name, adapter, config);
        ToolResponse::ok(json!({"watch_id": watch_id}))
    }

    /// Live or final status of a watcher.
    pub fn tool_watch_status(&self, watch_id: &str) -> ToolResponse {
        respond(self.watchers.status(watch_id))
    }

    /// Stop a watcher and return its final result.
    pub async fn tool_stop_watch(&self, watch_id: &str) -> ToolResponse {
        respond(self.watchers.stop(watch_id).await)
    }

    /// Recent events from the in-memory ring.
    pub fn tool_recent_events(&self, prefix: Option<&str>, limit: usize) -> ToolResponse {
        let events = match prefix {
            Some(prefix) => self.bus.recent_events_by_prefix(prefix, limit),
            None => self.bus.recent_events(None, limit),
        };
        ToolResponse::ok(json!({"events": events}))
    }
}
