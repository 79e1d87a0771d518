//! Named, lifecycle-managed collection of printer adapters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use kiln_events::{Event, EventBus, EventType};
use kiln_store::KilnDb;

use crate::adapter::PrinterAdapter;
use crate::{PrinterError, PrinterResult};

/// Thread-safe registry of adapter instances.
///
/// Registration persists `(name, backend, host, credential-id)` when a
/// store is attached — never a plaintext API key — and emits
/// printer.connected / printer.disconnected events when a bus is attached.
/// One printer may be marked as the default for sugared CLI commands.
pub struct PrinterRegistry {
    printers: RwLock<HashMap<String, Arc<dyn PrinterAdapter>>>,
    default_name: RwLock<Option<String>>,
    db: Option<Arc<KilnDb>>,
    bus: Option<Arc<EventBus>>,
}

impl PrinterRegistry {
    /// A registry with no persistence and no event wiring.
    pub fn new() -> Self {
        Self {
            printers: RwLock::new(HashMap::new()),
            default_name: RwLock::new(None),
            db: None,
            bus: None,
        }
    }

    /// A registry wired to the durable store and event bus.
    pub fn with_collaborators(db: Option<Arc<KilnDb>>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            printers: RwLock::new(HashMap::new()),
            default_name: RwLock::new(None),
            db,
            bus,
        }
    }

    /// Register (or replace) an adapter under `name`.
    ///
    /// The first registered printer becomes the default.
    pub fn register(
        &self,
        name: &str,
        adapter: Arc<dyn PrinterAdapter>,
        host: &str,
        credential_id: Option<&str>,
    ) -> PrinterResult<()> {
        if name.is_empty() {
            return Err(PrinterError::Validation("printer name must not be empty".into()));
        }
        let backend = adapter.name().to_string();
        {
            let mut printers = self.printers.write();
            printers.insert(name.to_string(), adapter);
            let mut default = self.default_name.write();
            if default.is_none() {
                *default = Some(name.to_string());
            }
        }

        if let Some(db) = &self.db {
            if let Err(err) = db.save_printer(name, &backend, host, credential_id) {
                tracing::warn!(printer = name, error = %err, "failed to persist printer");
            }
        }
        if let Some(bus) = &self.bus {
            bus.publish(Event::with_payload(
                EventType::PrinterConnected,
                json!({"printer_name": name, "backend": backend, "host": host}),
                "registry",
            ));
        }
        Ok(())
    }

    /// Remove a printer; `true` if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut printers = self.printers.write();
            let removed = printers.remove(name).is_some();
            if removed {
                let mut default = self.default_name.write();
                if default.as_deref() == Some(name) {
                    // Fall back to any remaining printer, lowest name first
                    // for determinism.
                    let mut names: Vec<&String> = printers.keys().collect();
                    names.sort();
                    *default = names.first().map(|n| (*n).clone());
                }
            }
            removed
        };

        if removed {
            if let Some(db) = &self.db {
                if let Err(err) = db.remove_printer(name) {
                    tracing::warn!(printer = name, error = %err, "failed to remove printer row");
                }
            }
            if let Some(bus) = &self.bus {
                bus.publish(Event::with_payload(
                    EventType::PrinterDisconnected,
                    json!({"printer_name": name}),
                    "registry",
                ));
            }
        }
        removed
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PrinterAdapter>> {
        self.printers.read().get(name).cloned()
    }

    /// The default printer's adapter, if one is set.
    pub fn get_default(&self) -> Option<(String, Arc<dyn PrinterAdapter>)> {
        let name = self.default_name.read().clone()?;
        let adapter = self.get(&name)?;
        Some((name, adapter))
    }

    /// Mark an existing printer as the default.
    pub fn set_default(&self, name: &str) -> PrinterResult<()> {
        if !self.printers.read().contains_key(name) {
            return Err(PrinterError::Validation(format!(
                "printer {name:?} is not registered"
            )));
        }
        *self.default_name.write() = Some(name.to_string());
        Ok(())
    }

    /// Registered printer names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.printers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered printers.
    pub fn len(&self) -> usize {
        self.printers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.printers.read().is_empty()
    }
}

impl Default for PrinterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        JobProgress, PrintResult, PrinterCapabilities, PrinterFile, PrinterState, UploadResult,
    };
    use async_trait::async_trait;
    use std::path::Path;

    struct NullAdapter;

    #[async_trait]
    impl PrinterAdapter for NullAdapter {
        fn name(&self) -> &str {
            "null"
        }
        fn capabilities(&self) -> PrinterCapabilities {
            PrinterCapabilities::default()
        }
        fn set_safety_profile(&self, _profile_id: &str) {}
        fn safety_profile(&self) -> Option<String> {
            None
        }
        async fn get_state(&self) -> PrinterResult<PrinterState> {
            Ok(PrinterState::offline())
        }
        async fn get_job(&self) -> PrinterResult<JobProgress> {
            Ok(JobProgress::idle())
        }
        async fn list_files(&self) -> PrinterResult<Vec<PrinterFile>> {
            Ok(vec![])
        }
        async fn upload_file(&self, _local_path: &Path) -> PrinterResult<UploadResult> {
            Err(PrinterError::Unsupported("null".into()))
        }
        async fn delete_file(&self, _remote_path: &str) -> PrinterResult<bool> {
            Ok(false)
        }
        async fn start_print(&self, _file_name: &str) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("noop"))
        }
        async fn cancel_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("noop"))
        }
        async fn pause_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("noop"))
        }
        async fn resume_print(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("noop"))
        }
        async fn emergency_stop(&self) -> PrinterResult<PrintResult> {
            Ok(PrintResult::ok("noop"))
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

    #[test]
    fn first_registered_becomes_default() {
        let registry = PrinterRegistry::new();
        registry
            .register("voron", Arc::new(NullAdapter), "http://voron.local", None)
            .unwrap();
        registry
            .register("ender", Arc::new(NullAdapter), "http://ender.local", None)
            .unwrap();
        let (name, _) = registry.get_default().unwrap();
        assert_eq!(name, "voron");
    }

    #[test]
    fn unregister_moves_default_deterministically() {
        let registry = PrinterRegistry::new();
        registry
            .register("voron", Arc::new(NullAdapter), "h", None)
            .unwrap();
        registry
            .register("zephyr", Arc::new(NullAdapter), "h", None)
            .unwrap();
        registry
            .register("ender", Arc::new(NullAdapter), "h", None)
            .unwrap();

        assert!(registry.unregister("voron"));
        let (name, _) = registry.get_default().unwrap();
        assert_eq!(name, "ender");
        assert!(!registry.unregister("voron"));
    }

    #[test]
    fn list_names_is_sorted() {
        let registry = PrinterRegistry::new();
        for name in ["zebra", "alpha", "middle"] {
            registry.register(name, Arc::new(NullAdapter), "h", None).unwrap();
        }
        assert_eq!(registry.list_names(), vec!["alpha", "middle", "zebra"]);
    }

    #[test]
    fn set_default_requires_registration() {
        let registry = PrinterRegistry::new();
        assert!(registry.set_default("ghost").is_err());
        registry.register("real", Arc::new(NullAdapter), "h", None).unwrap();
        registry.set_default("real").unwrap();
        assert_eq!(registry.get_default().unwrap().0, "real");
    }

    #[test]
    fn registration_persists_and_emits() {
        let db = Arc::new(KilnDb::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let registry =
            PrinterRegistry::with_collaborators(Some(db.clone()), Some(bus.clone()));
        registry
            .register("voron", Arc::new(NullAdapter), "http://voron.local", Some("cred-1"))
            .unwrap();

        let rows = db.list_printers().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].backend, "null");
        assert_eq!(rows[0].credential_id.as_deref(), Some("cred-1"));

        let events = bus.recent_events(Some(EventType::PrinterConnected), 10);
        assert_eq!(events.len(), 1);

        registry.unregister("voron");
        assert!(db.list_printers().unwrap().is_empty());
        assert_eq!(
            bus.recent_events(Some(EventType::PrinterDisconnected), 10).len(),
            1
        );
    }
}
