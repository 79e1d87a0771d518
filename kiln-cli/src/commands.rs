//! Command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use kiln_credentials::{CredentialStore, CredentialType};
use kiln_engine::queue::JobStatus;
use kiln_printers::{
    moonraker::MoonrakerAdapter, octoprint::OctoPrintAdapter, prusalink::PrusaLinkAdapter,
    PrinterAdapter, PrinterStatus,
};
use kiln_store::KilnDb;

use crate::output::CliError;

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "Multi-printer fleet orchestration", version)]
pub struct Cli {
    /// Printer host URL, overriding the stored registration.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// API key for the printer, overriding the credential store.
    #[arg(long, global = true, env = "KILN_API_KEY")]
    pub api_key: Option<String>,

    /// Printer backend when --host is used: octoprint, moonraker, prusalink.
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Registered printer name (defaults to the stored default).
    #[arg(long, global = true)]
    pub printer: Option<String>,

    /// Emit machine-readable JSON envelopes.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show printer state and job progress.
    Status,
    /// Upload a local G-code file to the printer.
    Upload { file: PathBuf },
    /// Start printing a file that exists on the printer.
    Print {
        file: String,
        /// Actually start; without this the command only reports what it
        /// would do.
        #[arg(long)]
        confirm: bool,
        /// Exit successfully without starting when a print is running.
        #[arg(long)]
        skip_if_printing: bool,
    },
    /// Cancel the running print.
    Cancel {
        #[arg(long)]
        confirm: bool,
    },
    /// Pause the running print.
    Pause,
    /// Resume a paused print.
    Resume,
    /// List files on the printer.
    Files,
    /// Run preflight checks (optionally scanning a local G-code file).
    Preflight { file: Option<PathBuf> },
    /// Capture a webcam snapshot.
    Snapshot {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Block until the active print finishes.
    Wait {
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Show job history.
    History {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Slice a model via the external slicer, optionally printing after.
    Slice {
        file: PathBuf,
        #[arg(long)]
        print_after: bool,
    },
    /// Set heater temperatures.
    Temp {
        #[arg(long)]
        tool: Option<f64>,
        #[arg(long)]
        bed: Option<f64>,
        /// Turn both heaters off.
        #[arg(long)]
        off: bool,
    },
    /// Send raw G-code commands.
    Gcode { commands: Vec<String> },
    /// Register a printer.
    Connect {
        #[arg(long)]
        name: String,
        #[arg(long)]
        backend: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Remove a registered printer.
    Disconnect {
        #[arg(long)]
        name: String,
    },
    /// Initialise the Kiln home directory and database.
    Init,
}

/// Shared handles for command execution.
pub struct CommandContext {
    pub db: Arc<KilnDb>,
    pub credentials: Arc<CredentialStore>,
    pub cli: Cli,
}

impl CommandContext {
    fn build_adapter(
        &self,
        backend: &str,
        host: &str,
        api_key: Option<&str>,
    ) -> Result<Arc<dyn PrinterAdapter>, CliError> {
        let adapter: Arc<dyn PrinterAdapter> = match backend {
            "octoprint" => Arc::new(
                OctoPrintAdapter::new(host, api_key.unwrap_or_default())
                    .map_err(CliError::from)?,
            ),
            "moonraker" => Arc::new(MoonrakerAdapter::new(host, api_key).map_err(CliError::from)?),
            "prusalink" => Arc::new(
                PrusaLinkAdapter::new(host, api_key.unwrap_or_default())
                    .map_err(CliError::from)?,
            ),
            other => {
                return Err(CliError::validation(format!(
                    "unknown backend {other:?}; expected octoprint, moonraker or prusalink"
                )))
            }
        };
        Ok(adapter)
    }

    /// Resolve the target adapter: explicit `--host/--backend` wins,
    /// otherwise the stored registration (named by `--printer`, else the
    /// first registered printer).
    pub fn resolve_adapter(&self) -> Result<(String, Arc<dyn PrinterAdapter>), CliError> {
        if let Some(host) = &self.cli.host {
            let backend = self.cli.backend.as_deref().ok_or_else(|| {
                CliError::validation("--backend is required when --host is given")
            })?;
            let adapter = self.build_adapter(backend, host, self.cli.api_key.as_deref())?;
            return Ok((host.clone(), adapter));
        }

        let printers = self.db.list_printers()?;
        let record = match &self.cli.printer {
            Some(name) => printers
                .into_iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| CliError::validation(format!("printer {name:?} is not registered")))?,
            None => printers.into_iter().next().ok_or_else(|| {
                CliError::validation(
                    "no printers registered; run `kiln connect` or pass --host/--backend",
                )
            })?,
        };

        let api_key = match (&self.cli.api_key, &record.credential_id) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(credential_id)) => Some(self.credentials.retrieve(credential_id)?),
            (None, None) => None,
        };
        let adapter = self.build_adapter(&record.backend, &record.host, api_key.as_deref())?;
        Ok((record.name, adapter))
    }

    pub async fn run(&self) -> Result<serde_json::Value, CliError> {
        match &self.cli.command {
            Commands::Status => {
                let (name, adapter) = self.resolve_adapter()?;
                let state = adapter.get_state().await?;
                let job = adapter.get_job().await?;
                Ok(json!({"printer": name, "state": state, "job": job}))
            }

            Commands::Upload { file } => {
                let (_, adapter) = self.resolve_adapter()?;
                let result = adapter.upload_file(file).await?;
                Ok(serde_json::to_value(result)
                    .map_err(|err| CliError::internal(err.to_string()))?)
            }

            Commands::Print {
                file,
                confirm,
                skip_if_printing,
            } => {
                let (_, adapter) = self.resolve_adapter()?;
                let state = adapter.get_state().await?;
                if state.status == PrinterStatus::Printing {
                    if *skip_if_printing {
                        return Ok(json!({"skipped": true, "reason": "printer already printing"}));
                    }
                    return Err(CliError::validation("printer is already printing"));
                }
                if !confirm {
                    return Err(CliError::confirmation_required(format!(
                        "would start printing {file}; re-run with --confirm"
                    )));
                }
                let result = adapter.start_print(file).await?;
                Ok(serde_json::to_value(result)
                    .map_err(|err| CliError::internal(err.to_string()))?)
            }

            Commands::Cancel { confirm } => {
                if !confirm {
                    return Err(CliError::confirmation_required(
                        "would cancel the running print; re-run with --confirm",
                    ));
                }
                let (_, adapter) = self.resolve_adapter()?;
                let result = adapter.cancel_print().await?;
                Ok(serde_json::to_value(result)
                    .map_err(|err| CliError::internal(err.to_string()))?)
            }

            Commands::Pause => {
                let (_, adapter) = self.resolve_adapter()?;
                let result = adapter.pause_print().await?;
                Ok(serde_json::to_value(result)
                    .map_err(|err| CliError::internal(err.to_string()))?)
            }

            Commands::Resume => {
                let (_, adapter) = self.resolve_adapter()?;
                let result = adapter.resume_print().await?;
                Ok(serde_json::to_value(result)
                    .map_err(|err| CliError::internal(err.to_string()))?)
            }

            Commands::Files => {
                let (_, adapter) = self.resolve_adapter()?;
                let files = adapter.list_files().await?;
                Ok(json!({"files": files}))
            }

            Commands::Preflight { file } => {
                let (name, adapter) = self.resolve_adapter()?;
                // A standalone preflight without the full service: check
                // connectivity, idleness and (optionally) the file scan.
                let state = adapter.get_state().await?;
                if !state.connected {
                    return Err(CliError::offline("printer is not connected"));
                }
                if state.status != PrinterStatus::Idle {
                    return Err(CliError::validation(format!(
                        "printer status is {}, expected idle",
                        state.status
                    )));
                }
                if let Some(path) = file {
                    let gcode = std::fs::read_to_string(path)
                        .map_err(|err| CliError::file(format!("cannot read {}: {err}", path.display())))?;
                    let registry = Arc::new(kiln_printers::PrinterRegistry::new());
                    registry.register(&name, adapter.clone(), "", None)?;
                    let safety = kiln_engine::safety::EmergencyCoordinator::new(registry, None);
                    safety
                        .preflight(&name, None, Some(&gcode))
                        .await
                        .map_err(CliError::from)?;
                }
                Ok(json!({"printer": name, "preflight": "passed"}))
            }

            Commands::Snapshot { output } => {
                let (_, adapter) = self.resolve_adapter()?;
                let Some(bytes) = adapter.get_snapshot().await? else {
                    return Err(CliError::validation(
                        "printer has no webcam or snapshots are unsupported",
                    ));
                };
                match output {
                    Some(path) => {
                        std::fs::write(path, &bytes)
                            .map_err(|err| CliError::file(err.to_string()))?;
                        Ok(json!({"written": path, "size_bytes": bytes.len()}))
                    }
                    None => Ok(json!({"size_bytes": bytes.len()})),
                }
            }

            Commands::Wait { timeout } => {
                let (_, adapter) = self.resolve_adapter()?;
                let started = std::time::Instant::now();
                loop {
                    let state = adapter.get_state().await?;
                    match state.status {
                        PrinterStatus::Idle => {
                            return Ok(json!({"outcome": "finished"}));
                        }
                        PrinterStatus::Error => {
                            return Err(CliError::internal("printer entered error state"));
                        }
                        _ => {}
                    }
                    if started.elapsed().as_secs() >= *timeout {
                        return Err(CliError::validation(format!(
                            "print did not finish within {timeout}s"
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }

            Commands::History { status, limit } => {
                let status_filter = match status {
                    Some(s) => Some(
                        JobStatus::parse(s)
                            .ok_or_else(|| CliError::validation(format!("unknown status {s:?}")))?,
                    ),
                    None => None,
                };
                let jobs = self
                    .db
                    .list_jobs(status_filter.map(|s| s.as_str()), *limit)?;
                Ok(json!({"jobs": jobs}))
            }

            Commands::Slice { file, print_after } => {
                let gcode_path = run_external_slicer(file).await?;
                let mut result = json!({"gcode_path": gcode_path});
                if *print_after {
                    let (_, adapter) = self.resolve_adapter()?;
                    let upload = adapter.upload_file(std::path::Path::new(&gcode_path)).await?;
                    let print = adapter.start_print(&upload.file_name).await?;
                    result["printed"] = json!(print.success);
                    result["remote_name"] = json!(upload.file_name);
                }
                Ok(result)
            }

            Commands::Temp { tool, bed, off } => {
                let (_, adapter) = self.resolve_adapter()?;
                if *off {
                    adapter.set_tool_temp(0.0).await?;
                    adapter.set_bed_temp(0.0).await?;
                    return Ok(json!({"tool": 0.0, "bed": 0.0}));
                }
                if tool.is_none() && bed.is_none() {
                    return Err(CliError::validation("pass --tool, --bed or --off"));
                }
                if let Some(target) = tool {
                    adapter.set_tool_temp(*target).await?;
                }
                if let Some(target) = bed {
                    adapter.set_bed_temp(*target).await?;
                }
                Ok(json!({"tool": tool, "bed": bed}))
            }

            Commands::Gcode { commands } => {
                if commands.is_empty() {
                    return Err(CliError::validation("no G-code commands given"));
                }
                let (_, adapter) = self.resolve_adapter()?;
                adapter.send_gcode(commands).await?;
                Ok(json!({"sent": commands.len()}))
            }

            Commands::Connect {
                name,
                backend,
                host,
                api_key,
            } => {
                // Validate the backend before storing anything.
                self.build_adapter(backend, host, api_key.as_deref())?;
                let credential_id = match api_key {
                    Some(key) => Some(
                        self.credentials
                            .store(CredentialType::ApiKey, key, &format!("{name} API key"))?
                            .credential_id,
                    ),
                    None => None,
                };
                self.db
                    .save_printer(name, backend, host, credential_id.as_deref())?;
                Ok(json!({"registered": name, "backend": backend, "host": host}))
            }

            Commands::Disconnect { name } => {
                if !self.db.remove_printer(name)? {
                    return Err(CliError::validation(format!(
                        "printer {name:?} is not registered"
                    )));
                }
                Ok(json!({"removed": name}))
            }

            Commands::Init => {
                // Opening the handles created the directories and schema.
                Ok(json!({
                    "db_path": self.db.path(),
                    "credentials_path": self.credentials.path(),
                }))
            }
        }
    }
}

/// Slice via the external PrusaSlicer binary (slicing itself is out of
/// scope; we only shell out).
async fn run_external_slicer(model: &PathBuf) -> Result<String, CliError> {
    if !model.exists() {
        return Err(CliError::file(format!("model not found: {}", model.display())));
    }
    let output_path = model.with_extension("gcode");
    let binary = ["prusa-slicer", "PrusaSlicer", "slic3r"]
        .iter()
        .find(|name| which(name))
        .ok_or_else(|| {
            CliError::validation(
                "no slicer binary found on PATH (expected prusa-slicer or PrusaSlicer)",
            )
        })?;

    let status = tokio::process::Command::new(binary)
        .arg("--export-gcode")
        .arg(model)
        .arg("--output")
        .arg(&output_path)
        .status()
        .await
        .map_err(|err| CliError::internal(format!("failed to launch slicer: {err}")))?;
    if !status.success() {
        return Err(CliError::internal(format!(
            "slicer exited with status {status}"
        )));
    }
    Ok(output_path.to_string_lossy().into_owned())
}

fn which(binary: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_print_with_flags() {
        let cli = Cli::parse_from([
            "kiln",
            "print",
            "benchy.gcode",
            "--confirm",
            "--skip-if-printing",
        ]);
        match cli.command {
            Commands::Print {
                file,
                confirm,
                skip_if_printing,
            } => {
                assert_eq!(file, "benchy.gcode");
                assert!(confirm);
                assert!(skip_if_printing);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_global_flags() {
        let cli = Cli::parse_from([
            "kiln",
            "--host",
            "http://voron.local",
            "--backend",
            "moonraker",
            "--json",
            "status",
        ]);
        assert_eq!(cli.host.as_deref(), Some("http://voron.local"));
        assert_eq!(cli.backend.as_deref(), Some("moonraker"));
        assert!(cli.json);
    }

    #[test]
    fn parses_temp_variants() {
        let cli = Cli::parse_from(["kiln", "temp", "--tool", "210", "--bed", "60"]);
        match cli.command {
            Commands::Temp { tool, bed, off } => {
                assert_eq!(tool, Some(210.0));
                assert_eq!(bed, Some(60.0));
                assert!(!off);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_connect() {
        let cli = Cli::parse_from([
            "kiln", "connect", "--name", "voron", "--backend", "moonraker", "--host",
            "http://voron.local:7125",
        ]);
        match cli.command {
            Commands::Connect { name, backend, .. } => {
                assert_eq!(name, "voron");
                assert_eq!(backend, "moonraker");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(KilnDb::open(Some(&dir.path().join("kiln.db"))).unwrap());
        let credentials = Arc::new(
            CredentialStore::open(Some("test-key"), Some(&dir.path().join("creds.db"))).unwrap(),
        );
        let cli = Cli::parse_from([
            "kiln",
            "--host",
            "http://x.local",
            "--backend",
            "toaster",
            "status",
        ]);
        let ctx = CommandContext {
            db,
            credentials,
            cli,
        };
        let err = ctx.run().await.unwrap_err();
        assert_eq!(err.exit_code, 2);
    }

    #[tokio::test]
    async fn cancel_without_confirm_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(KilnDb::open(Some(&dir.path().join("kiln.db"))).unwrap());
        let credentials = Arc::new(
            CredentialStore::open(Some("test-key"), Some(&dir.path().join("creds.db"))).unwrap(),
        );
        let cli = Cli::parse_from(["kiln", "cancel"]);
        let ctx = CommandContext {
            db,
            credentials,
            cli,
        };
        let err = ctx.run().await.unwrap_err();
        assert_eq!(err.exit_code, 5);
    }

    #[tokio::test]
    async fn connect_stores_key_in_credential_store_not_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(KilnDb::open(Some(&dir.path().join("kiln.db"))).unwrap());
        let credentials = Arc::new(
            CredentialStore::open(Some("test-key"), Some(&dir.path().join("creds.db"))).unwrap(),
        );
        let cli = Cli::parse_from([
            "kiln", "connect", "--name", "voron", "--backend", "octoprint", "--host",
            "http://voron.local", "--api-key", "secret-key-123",
        ]);
        let ctx = CommandContext {
            db: db.clone(),
            credentials: credentials.clone(),
            cli,
        };
        ctx.run().await.unwrap();

        let printers = db.list_printers().unwrap();
        assert_eq!(printers.len(), 1);
        let credential_id = printers[0].credential_id.clone().unwrap();
        // The plaintext never lands in the printers table...
        assert_ne!(credential_id, "secret-key-123");
        // ...but round-trips through the credential store.
        assert_eq!(credentials.retrieve(&credential_id).unwrap(), "secret-key-123");
    }

    #[tokio::test]
    async fn history_filter_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(KilnDb::open(Some(&dir.path().join("kiln.db"))).unwrap());
        let credentials = Arc::new(
            CredentialStore::open(Some("test-key"), Some(&dir.path().join("creds.db"))).unwrap(),
        );
        let cli = Cli::parse_from(["kiln", "history", "--status", "melting"]);
        let ctx = CommandContext {
            db,
            credentials,
            cli,
        };
        let err = ctx.run().await.unwrap_err();
        assert_eq!(err.exit_code, 2);
    }
}
