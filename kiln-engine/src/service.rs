//! Central service wiring.
//!
//! Components are collaborator dependencies of one [`KilnService`]
//! constructed at startup; there is no hidden initialization order between
//! them — the only real dependency is the durable store, which several of
//! them reference.

use std::sync::Arc;

use kiln_events::{AsyncEventBus, EventBus};
use kiln_printers::PrinterRegistry;
use kiln_store::KilnDb;

use crate::material::SubstitutionMatrix;
use crate::pipelines::Pipelines;
use crate::print_dna::PrintDna;
use crate::progress::ProgressEstimator;
use crate::queue::PrintQueue;
use crate::router::JobRouter;
use crate::safety::EmergencyCoordinator;
use crate::watcher::WatcherRegistry;
use crate::EngineResult;

/// The assembled orchestration core.
pub struct KilnService {
    pub db: Arc<KilnDb>,
    pub bus: Arc<EventBus>,
    /// Async fan-out for slow sinks (webhooks, cloud sync). Constructed
    /// here; call [`AsyncEventBus::start`] from a runtime to drain it.
    pub async_bus: Arc<AsyncEventBus>,
    pub registry: Arc<PrinterRegistry>,
    pub queue: Arc<PrintQueue>,
    pub router: JobRouter,
    pub safety: Arc<EmergencyCoordinator>,
    pub estimator: Arc<ProgressEstimator>,
    pub watchers: Arc<WatcherRegistry>,
    pub pipelines: Pipelines,
    pub substitutions: SubstitutionMatrix,
    pub print_dna: PrintDna,
}

impl KilnService {
    /// Build the service over an opened store. Wires the event bus into
    /// the store (durable event log) and reloads interrupted jobs.
    pub fn new(db: Arc<KilnDb>) -> EngineResult<Self> {
        let bus = Arc::new(EventBus::new());

        // Durable event log: every published event lands in the store.
        let persist_db = db.clone();
        bus.subscribe_all("persistence", move |event| {
            let data = serde_json::Value::Object(event.data.clone());
            if let Err(err) = persist_db.log_event(
                event.event_type.as_str(),
                &data,
                &event.source,
                Some(event.timestamp),
            ) {
                tracing::warn!(error = %err, "failed to persist event");
            }
        });

        let registry = Arc::new(PrinterRegistry::with_collaborators(
            Some(db.clone()),
            Some(bus.clone()),
        ));
        let queue = Arc::new(PrintQueue::with_collaborators(
            Some(db.clone()),
            Some(bus.clone()),
        ));
        let recovered = queue.recover_from_store()?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued jobs from the durable store");
        }

        let safety = Arc::new(EmergencyCoordinator::new(registry.clone(), Some(bus.clone())));
        let watchers = Arc::new(WatcherRegistry::new(Some(bus.clone())));
        let pipelines = Pipelines::new(registry.clone(), queue.clone(), safety.clone());

        Ok(Self {
            db: db.clone(),
            bus,
            async_bus: Arc::new(AsyncEventBus::from_env()),
            registry,
            queue,
            router: JobRouter::new(),
            safety,
            estimator: Arc::new(ProgressEstimator::new()),
            watchers,
            pipelines,
            substitutions: SubstitutionMatrix::new(),
            print_dna: PrintDna::new(db),
        })
    }

    /// Convenience constructor over an in-memory store.
    pub fn in_memory() -> EngineResult<Self> {
        Ok(Self::new(Arc::new(KilnDb::open_in_memory()?))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_events::{Event, EventType};
    use serde_json::json;

    #[test]
    fn service_wires_durable_event_log() {
        let service = KilnService::in_memory().unwrap();
        service.bus.publish(Event::with_payload(
            EventType::PrintStarted,
            json!({"printer_name": "voron"}),
            "test",
        ));

        let stored = service.db.recent_events(Some("print.started"), 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data["printer_name"], "voron");
    }

    #[test]
    fn service_recovers_queue_on_startup() {
        let db = Arc::new(KilnDb::open_in_memory().unwrap());
        {
            let first = KilnService::new(db.clone()).unwrap();
            let job_id = first
                .queue
                .submit(crate::queue::JobRequest::new("benchy.gcode"))
                .unwrap();
            first.queue.mark_printing(&job_id).unwrap();
        }

        let second = KilnService::new(db).unwrap();
        assert_eq!(second.queue.pending_count(), 1);
    }
}
