//! The durable store itself.

use std::path::{Path, PathBuf};

use chrono::{Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::records::{
    ChargeRecord, JobRecord, MonthlySummary, PaymentMethodRecord, PaymentRecord, PrintDnaRow,
    PrinterRecord, StoredEvent,
};
use crate::{StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    file_name       TEXT NOT NULL,
    printer_name    TEXT,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    submitted_by    TEXT NOT NULL DEFAULT 'unknown',
    submitted_at    REAL NOT NULL,
    started_at      REAL,
    completed_at    REAL,
    error_message   TEXT,
    metadata_json   TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_jobs_status
    ON jobs(status, priority DESC, submitted_at ASC);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,
    data_json   TEXT NOT NULL DEFAULT '{}',
    source      TEXT NOT NULL DEFAULT '',
    timestamp   REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_type_ts
    ON events(event_type, timestamp);

CREATE TABLE IF NOT EXISTS printers (
    name           TEXT PRIMARY KEY,
    backend        TEXT NOT NULL,
    host           TEXT NOT NULL,
    credential_id  TEXT,
    registered_at  REAL NOT NULL,
    last_seen      REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS billing_charges (
    job_id          TEXT NOT NULL,
    fee_amount      REAL NOT NULL,
    fee_percent     REAL NOT NULL,
    job_cost        REAL NOT NULL,
    currency        TEXT NOT NULL DEFAULT 'USD',
    waived          INTEGER NOT NULL DEFAULT 0,
    waiver_reason   TEXT,
    payment_id      TEXT,
    payment_rail    TEXT,
    payment_status  TEXT NOT NULL DEFAULT 'pending',
    user_email      TEXT,
    timestamp       REAL NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_billing_job_id
    ON billing_charges(job_id);

CREATE TABLE IF NOT EXISTS payments (
    payment_id  TEXT PRIMARY KEY,
    job_id      TEXT NOT NULL,
    rail        TEXT NOT NULL,
    amount      REAL NOT NULL,
    currency    TEXT NOT NULL,
    status      TEXT NOT NULL,
    tx_hash     TEXT,
    created_at  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_methods (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    rail          TEXT NOT NULL,
    provider_ref  TEXT NOT NULL,
    label         TEXT NOT NULL DEFAULT '',
    is_default    INTEGER NOT NULL DEFAULT 0,
    created_at    REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS print_dna (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    file_hash            TEXT NOT NULL,
    geometric_signature  TEXT NOT NULL,
    triangle_count       INTEGER NOT NULL,
    bbox_x               REAL NOT NULL,
    bbox_y               REAL NOT NULL,
    bbox_z               REAL NOT NULL,
    volume_mm3           REAL NOT NULL,
    surface_area_mm2     REAL NOT NULL,
    printer_model        TEXT NOT NULL,
    material             TEXT NOT NULL,
    settings_json        TEXT NOT NULL DEFAULT '{}',
    outcome              TEXT NOT NULL,
    quality_grade        TEXT,
    failure_mode         TEXT,
    print_time_s         REAL,
    timestamp            REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dna_hash ON print_dna(file_hash);
CREATE INDEX IF NOT EXISTS idx_dna_signature ON print_dna(geometric_signature);
"#;

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Unix-second bounds of a UTC calendar month: `[start, next_month_start)`.
fn month_bounds(year: i32, month: u32) -> (f64, f64) {
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(0.0);
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let end = Utc
        .with_ymd_and_hms(ny, nm, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(f64::MAX);
    (start, end)
}

fn current_month_bounds() -> (f64, f64) {
    let now = Utc::now();
    month_bounds(now.year(), now.month())
}

/// Durable store shared across the engine, billing and registry layers.
///
/// The connection is guarded by a single lock; SQLite itself runs in WAL
/// mode with a 5 s busy timeout so concurrent processes back off instead of
/// failing.
pub struct KilnDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl KilnDb {
    /// Open (or create) the store at `db_path`. When `None`, the path comes
    /// from `KILN_DB_PATH`, falling back to `~/.kiln/kiln.db`.
    pub fn open(db_path: Option<&Path>) -> StoreResult<Self> {
        let path = match db_path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("KILN_DB_PATH") {
                Ok(p) if !p.is_empty() => PathBuf::from(p),
                _ => default_db_path()?,
            },
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// An in-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Filesystem path of the backing database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert or update a job row.
    pub fn save_job(&self, job: &JobRecord) -> StoreResult<()> {
        let metadata = serde_json::to_string(&job.metadata)?;
        self.conn.lock().execute(
            "INSERT INTO jobs (id, file_name, printer_name, status, priority,
                               submitted_by, submitted_at, started_at, completed_at,
                               error_message, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 file_name = excluded.file_name,
                 printer_name = excluded.printer_name,
                 status = excluded.status,
                 priority = excluded.priority,
                 submitted_by = excluded.submitted_by,
                 submitted_at = excluded.submitted_at,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 error_message = excluded.error_message,
                 metadata_json = excluded.metadata_json",
            params![
                job.id,
                job.file_name,
                job.printer_name,
                job.status,
                job.priority,
                job.submitted_by,
                job.submitted_at,
                job.started_at,
                job.completed_at,
                job.error_message,
                metadata,
            ],
        )?;
        Ok(())
    }

    fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
        let metadata_json: String = row.get("metadata_json")?;
        let metadata: Map<String, Value> =
            serde_json::from_str(&metadata_json).unwrap_or_default();
        Ok(JobRecord {
            id: row.get("id")?,
            file_name: row.get("file_name")?,
            printer_name: row.get("printer_name")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            submitted_by: row.get("submitted_by")?,
            submitted_at: row.get("submitted_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            metadata,
        })
    }

    /// Fetch one job by id.
    pub fn get_job(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![job_id],
                Self::job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs ordered by `(priority desc, submitted_at asc)`.
    pub fn list_jobs(&self, status: Option<&str>, limit: usize) -> StoreResult<Vec<JobRecord>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1
                     ORDER BY priority DESC, submitted_at ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status, limit as i64], Self::job_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs
                     ORDER BY priority DESC, submitted_at ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], Self::job_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Jobs whose status is not terminal. Used for crash recovery: the
    /// queue reloads these as `queued` at startup.
    pub fn non_terminal_jobs(&self) -> StoreResult<Vec<JobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE status NOT IN ('completed', 'failed', 'cancelled')
             ORDER BY priority DESC, submitted_at ASC",
        )?;
        let rows = stmt.query_map([], Self::job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event row; returns the row id.
    pub fn log_event(
        &self,
        event_type: &str,
        data: &Value,
        source: &str,
        timestamp: Option<f64>,
    ) -> StoreResult<i64> {
        let data_json = serde_json::to_string(data)?;
        let ts = timestamp.unwrap_or_else(now_ts);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (event_type, data_json, source, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, data_json, source, ts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent events, newest first, optionally filtered by type.
    pub fn recent_events(
        &self,
        event_type: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        let conn = self.conn.lock();
        let map = |row: &Row<'_>| -> rusqlite::Result<StoredEvent> {
            let data_json: String = row.get("data_json")?;
            Ok(StoredEvent {
                id: row.get("id")?,
                event_type: row.get("event_type")?,
                data: serde_json::from_str(&data_json).unwrap_or(Value::Null),
                source: row.get("source")?,
                timestamp: row.get("timestamp")?,
            })
        };
        let mut out = Vec::new();
        match event_type {
            Some(ty) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events WHERE event_type = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                for row in stmt.query_map(params![ty, limit as i64], map)? {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                for row in stmt.query_map(params![limit as i64], map)? {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Printers
    // ------------------------------------------------------------------

    /// Insert or update a printer row. Plaintext API keys never land here;
    /// callers pass a credential-store reference instead.
    pub fn save_printer(
        &self,
        name: &str,
        backend: &str,
        host: &str,
        credential_id: Option<&str>,
    ) -> StoreResult<()> {
        let now = now_ts();
        self.conn.lock().execute(
            "INSERT INTO printers (name, backend, host, credential_id, registered_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 backend = excluded.backend,
                 host = excluded.host,
                 credential_id = excluded.credential_id,
                 last_seen = excluded.last_seen",
            params![name, backend, host, credential_id, now],
        )?;
        Ok(())
    }

    /// All registered printers, sorted by name.
    pub fn list_printers(&self) -> StoreResult<Vec<PrinterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM printers ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(PrinterRecord {
                name: row.get("name")?,
                backend: row.get("backend")?,
                host: row.get("host")?,
                credential_id: row.get("credential_id")?,
                registered_at: row.get("registered_at")?,
                last_seen: row.get("last_seen")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove a printer; `true` if a row was deleted.
    pub fn remove_printer(&self, name: &str) -> StoreResult<bool> {
        let count = self
            .conn
            .lock()
            .execute("DELETE FROM printers WHERE name = ?1", params![name])?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Billing charges
    // ------------------------------------------------------------------

    /// Record a charge; the unique job_id index makes replays a no-op.
    /// Returns `true` when a new row was inserted.
    pub fn save_billing_charge(&self, charge: &ChargeRecord) -> StoreResult<bool> {
        let count = self.conn.lock().execute(
            "INSERT OR IGNORE INTO billing_charges
                 (job_id, fee_amount, fee_percent, job_cost, currency, waived,
                  waiver_reason, payment_id, payment_rail, payment_status,
                  user_email, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                charge.job_id,
                charge.fee_amount,
                charge.fee_percent,
                charge.job_cost,
                charge.currency,
                charge.waived,
                charge.waiver_reason,
                charge.payment_id,
                charge.payment_rail,
                charge.payment_status,
                charge.user_email,
                charge.timestamp,
            ],
        )?;
        Ok(count > 0)
    }

    fn charge_from_row(row: &Row<'_>) -> rusqlite::Result<ChargeRecord> {
        Ok(ChargeRecord {
            job_id: row.get("job_id")?,
            fee_amount: row.get("fee_amount")?,
            fee_percent: row.get("fee_percent")?,
            job_cost: row.get("job_cost")?,
            currency: row.get("currency")?,
            waived: row.get("waived")?,
            waiver_reason: row.get("waiver_reason")?,
            payment_id: row.get("payment_id")?,
            payment_rail: row.get("payment_rail")?,
            payment_status: row.get("payment_status")?,
            user_email: row.get("user_email")?,
            timestamp: row.get("timestamp")?,
        })
    }

    /// Fetch the charge for a job, if any.
    pub fn get_billing_charge(&self, job_id: &str) -> StoreResult<Option<ChargeRecord>> {
        let conn = self.conn.lock();
        let charge = conn
            .query_row(
                "SELECT * FROM billing_charges WHERE job_id = ?1",
                params![job_id],
                Self::charge_from_row,
            )
            .optional()?;
        Ok(charge)
    }

    /// Recent charges, newest first.
    pub fn list_billing_charges(&self, limit: usize) -> StoreResult<Vec<ChargeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM billing_charges ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::charge_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count of charges recorded in the current UTC calendar month.
    pub fn billing_charges_this_month(&self) -> StoreResult<i64> {
        let (start, end) = current_month_bounds();
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM billing_charges WHERE timestamp >= ?1 AND timestamp < ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Per-user count of charges in the current UTC calendar month.
    pub fn charges_this_month_for_user(&self, user_email: &str) -> StoreResult<i64> {
        let (start, end) = current_month_bounds();
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM billing_charges
             WHERE user_email = ?1 AND timestamp >= ?2 AND timestamp < ?3",
            params![user_email, start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Tag an existing charge with the user's email for free-tier tracking.
    pub fn set_charge_user(&self, job_id: &str, user_email: &str) -> StoreResult<()> {
        self.conn.lock().execute(
            "UPDATE billing_charges SET user_email = ?1 WHERE job_id = ?2",
            params![user_email, job_id],
        )?;
        Ok(())
    }

    /// Aggregate fees for one UTC calendar month (current month when `None`).
    pub fn monthly_billing_summary(
        &self,
        year: Option<i32>,
        month: Option<u32>,
    ) -> StoreResult<MonthlySummary> {
        let (start, end) = match (year, month) {
            (Some(y), Some(m)) => month_bounds(y, m),
            _ => current_month_bounds(),
        };
        let conn = self.conn.lock();
        let (total, count, waived) = conn.query_row(
            "SELECT COALESCE(SUM(fee_amount), 0.0), COUNT(*),
                    COALESCE(SUM(CASE WHEN waived THEN 1 ELSE 0 END), 0)
             FROM billing_charges WHERE timestamp >= ?1 AND timestamp < ?2",
            params![start, end],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;
        Ok(MonthlySummary {
            total_fees: (total * 100.0).round() / 100.0,
            job_count: count,
            waived_count: waived,
        })
    }

    /// Sum of fee amounts in a rolling 24 h window ending now.
    pub fn fees_last_24h(&self) -> StoreResult<f64> {
        let cutoff = now_ts() - 86_400.0;
        let conn = self.conn.lock();
        let total = conn.query_row(
            "SELECT COALESCE(SUM(fee_amount), 0.0) FROM billing_charges WHERE timestamp >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    pub fn save_payment(&self, payment: &PaymentRecord) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO payments
                 (payment_id, job_id, rail, amount, currency, status, tx_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(payment_id) DO UPDATE SET
                 status = excluded.status,
                 tx_hash = excluded.tx_hash",
            params![
                payment.payment_id,
                payment.job_id,
                payment.rail,
                payment.amount,
                payment.currency,
                payment.status,
                payment.tx_hash,
                payment.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_payment_status(
        &self,
        payment_id: &str,
        status: &str,
        tx_hash: Option<&str>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "UPDATE payments SET status = ?1, tx_hash = COALESCE(?2, tx_hash)
             WHERE payment_id = ?3",
            params![status, tx_hash, payment_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment methods
    // ------------------------------------------------------------------

    pub fn save_payment_method(&self, method: &PaymentMethodRecord) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO payment_methods
                 (id, user_id, rail, provider_ref, label, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 is_default = excluded.is_default",
            params![
                method.id,
                method.user_id,
                method.rail,
                method.provider_ref,
                method.label,
                method.is_default,
                method.created_at,
            ],
        )?;
        Ok(())
    }

    fn method_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentMethodRecord> {
        Ok(PaymentMethodRecord {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            rail: row.get("rail")?,
            provider_ref: row.get("provider_ref")?,
            label: row.get("label")?,
            is_default: row.get("is_default")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn list_payment_methods(&self, user_id: &str) -> StoreResult<Vec<PaymentMethodRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM payment_methods WHERE user_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::method_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_default_payment_method(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<PaymentMethodRecord>> {
        let conn = self.conn.lock();
        let method = conn
            .query_row(
                "SELECT * FROM payment_methods WHERE user_id = ?1 AND is_default = 1",
                params![user_id],
                Self::method_from_row,
            )
            .optional()?;
        Ok(method)
    }

    // ------------------------------------------------------------------
    // Print DNA
    // ------------------------------------------------------------------

    /// Append one outcome row to the learning history.
    pub fn insert_print_dna(&self, row: &PrintDnaRow) -> StoreResult<i64> {
        let settings = serde_json::to_string(&row.settings)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO print_dna
                 (file_hash, geometric_signature, triangle_count,
                  bbox_x, bbox_y, bbox_z, volume_mm3, surface_area_mm2,
                  printer_model, material, settings_json, outcome,
                  quality_grade, failure_mode, print_time_s, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                row.file_hash,
                row.geometric_signature,
                row.triangle_count,
                row.bbox_mm.0,
                row.bbox_mm.1,
                row.bbox_mm.2,
                row.volume_mm3,
                row.surface_area_mm2,
                row.printer_model,
                row.material,
                settings,
                row.outcome,
                row.quality_grade,
                row.failure_mode,
                row.print_time_s,
                row.timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn dna_from_row(row: &Row<'_>) -> rusqlite::Result<PrintDnaRow> {
        let settings_json: String = row.get("settings_json")?;
        Ok(PrintDnaRow {
            file_hash: row.get("file_hash")?,
            geometric_signature: row.get("geometric_signature")?,
            triangle_count: row.get("triangle_count")?,
            bbox_mm: (row.get("bbox_x")?, row.get("bbox_y")?, row.get("bbox_z")?),
            volume_mm3: row.get("volume_mm3")?,
            surface_area_mm2: row.get("surface_area_mm2")?,
            printer_model: row.get("printer_model")?,
            material: row.get("material")?,
            settings: serde_json::from_str(&settings_json).unwrap_or_default(),
            outcome: row.get("outcome")?,
            quality_grade: row.get("quality_grade")?,
            failure_mode: row.get("failure_mode")?,
            print_time_s: row.get("print_time_s")?,
            timestamp: row.get("timestamp")?,
        })
    }

    /// All outcome rows for an exact file hash, newest first.
    pub fn print_dna_by_hash(&self, file_hash: &str, limit: usize) -> StoreResult<Vec<PrintDnaRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM print_dna WHERE file_hash = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![file_hash, limit as i64], Self::dna_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All outcome rows sharing a geometric signature, newest first.
    pub fn print_dna_by_signature(
        &self,
        signature: &str,
        limit: usize,
    ) -> StoreResult<Vec<PrintDnaRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM print_dna WHERE geometric_signature = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![signature, limit as i64], Self::dna_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn default_db_path() -> StoreResult<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| StoreError::Path("HOME is not set and no db path given".into()))?;
    Ok(home.join(".kiln").join("kiln.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job(id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            file_name: "benchy.gcode".into(),
            printer_name: None,
            status: "queued".into(),
            priority: 0,
            submitted_by: "agent".into(),
            submitted_at: now_ts(),
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata: Map::new(),
        }
    }

    fn make_charge(job_id: &str, fee: f64, waived: bool) -> ChargeRecord {
        ChargeRecord {
            job_id: job_id.to_string(),
            fee_amount: fee,
            fee_percent: 5.0,
            job_cost: fee * 20.0,
            currency: "USD".into(),
            waived,
            waiver_reason: waived.then(|| "Free tier".to_string()),
            payment_id: None,
            payment_rail: None,
            payment_status: if waived { "waived".into() } else { "completed".into() },
            user_email: None,
            timestamp: now_ts(),
        }
    }

    #[test]
    fn creates_file_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("nested").join("kiln.db");
        let db = KilnDb::open(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path);
    }

    #[test]
    fn schema_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");
        {
            let db = KilnDb::open(Some(&path)).unwrap();
            db.set_setting("k", "v").unwrap();
        }
        let db = KilnDb::open(Some(&path)).unwrap();
        assert_eq!(db.get_setting("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn job_upsert_and_fetch() {
        let db = KilnDb::open_in_memory().unwrap();
        let mut job = make_job("job-001");
        db.save_job(&job).unwrap();
        assert_eq!(db.get_job("job-001").unwrap().unwrap().status, "queued");

        job.status = "printing".into();
        job.started_at = Some(now_ts());
        db.save_job(&job).unwrap();
        let fetched = db.get_job("job-001").unwrap().unwrap();
        assert_eq!(fetched.status, "printing");
        assert!(fetched.started_at.is_some());
    }

    #[test]
    fn get_job_missing_is_none() {
        let db = KilnDb::open_in_memory().unwrap();
        assert!(db.get_job("nope").unwrap().is_none());
    }

    #[test]
    fn list_jobs_orders_by_priority_then_fifo() {
        let db = KilnDb::open_in_memory().unwrap();
        let now = now_ts();
        let mut low_old = make_job("low-old");
        low_old.submitted_at = now - 10.0;
        let mut high = make_job("high");
        high.priority = 10;
        high.submitted_at = now;
        let mut low_new = make_job("low-new");
        low_new.submitted_at = now + 1.0;
        db.save_job(&low_old).unwrap();
        db.save_job(&high).unwrap();
        db.save_job(&low_new).unwrap();

        let jobs = db.list_jobs(None, 10).unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low-old", "low-new"]);
    }

    #[test]
    fn list_jobs_filters_by_status() {
        let db = KilnDb::open_in_memory().unwrap();
        db.save_job(&make_job("a")).unwrap();
        let mut printing = make_job("b");
        printing.status = "printing".into();
        db.save_job(&printing).unwrap();

        let queued = db.list_jobs(Some("queued"), 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "a");
    }

    #[test]
    fn non_terminal_jobs_excludes_finished() {
        let db = KilnDb::open_in_memory().unwrap();
        db.save_job(&make_job("live")).unwrap();
        let mut done = make_job("done");
        done.status = "completed".into();
        db.save_job(&done).unwrap();
        let mut cancelled = make_job("cxl");
        cancelled.status = "cancelled".into();
        db.save_job(&cancelled).unwrap();

        let live = db.non_terminal_jobs().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "live");
    }

    #[test]
    fn events_round_trip_json_payload() {
        let db = KilnDb::open_in_memory().unwrap();
        let data = json!({"printer": "voron", "temp": 205.0, "nested": {"a": 1}});
        let id = db.log_event("print.started", &data, "test", None).unwrap();
        assert!(id >= 1);

        let events = db.recent_events(None, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, data);
        assert_eq!(events[0].source, "test");
    }

    #[test]
    fn recent_events_newest_first_and_filtered() {
        let db = KilnDb::open_in_memory().unwrap();
        db.log_event("first", &Value::Null, "", Some(100.0)).unwrap();
        db.log_event("second", &Value::Null, "", Some(200.0)).unwrap();
        db.log_event("first", &Value::Null, "", Some(300.0)).unwrap();

        let all = db.recent_events(None, 10).unwrap();
        assert_eq!(all[0].timestamp, 300.0);

        let firsts = db.recent_events(Some("first"), 10).unwrap();
        assert_eq!(firsts.len(), 2);
    }

    #[test]
    fn printer_upsert_sorted_listing_and_removal() {
        let db = KilnDb::open_in_memory().unwrap();
        db.save_printer("zebra", "octoprint", "http://z.local", None).unwrap();
        db.save_printer("alpha", "moonraker", "http://a.local", Some("cred-1")).unwrap();
        db.save_printer("zebra", "moonraker", "http://new.local", None).unwrap();

        let printers = db.list_printers().unwrap();
        let names: Vec<&str> = printers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zebra"]);
        assert_eq!(printers[1].host, "http://new.local");
        assert_eq!(printers[0].credential_id.as_deref(), Some("cred-1"));

        assert!(db.remove_printer("zebra").unwrap());
        assert!(!db.remove_printer("zebra").unwrap());
    }

    #[test]
    fn settings_overwrite() {
        let db = KilnDb::open_in_memory().unwrap();
        db.set_setting("mode", "auto").unwrap();
        db.set_setting("mode", "manual").unwrap();
        assert_eq!(db.get_setting("mode").unwrap().as_deref(), Some("manual"));
        assert!(db.get_setting("missing").unwrap().is_none());
    }

    #[test]
    fn billing_charge_is_idempotent_on_job_id() {
        let db = KilnDb::open_in_memory().unwrap();
        let charge = make_charge("job-1", 5.0, false);
        assert!(db.save_billing_charge(&charge).unwrap());

        let mut replay = make_charge("job-1", 99.0, false);
        replay.payment_status = "completed".into();
        assert!(!db.save_billing_charge(&replay).unwrap());

        let stored = db.get_billing_charge("job-1").unwrap().unwrap();
        assert_eq!(stored.fee_amount, 5.0);
        assert_eq!(db.list_billing_charges(10).unwrap().len(), 1);
    }

    #[test]
    fn monthly_summary_counts_and_rounds() {
        let db = KilnDb::open_in_memory().unwrap();
        db.save_billing_charge(&make_charge("a", 1.6665, false)).unwrap();
        db.save_billing_charge(&make_charge("b", 0.0, true)).unwrap();

        let summary = db.monthly_billing_summary(None, None).unwrap();
        assert_eq!(summary.job_count, 2);
        assert_eq!(summary.waived_count, 1);
        assert_eq!(summary.total_fees, 1.67);
        assert_eq!(db.billing_charges_this_month().unwrap(), 2);
    }

    #[test]
    fn per_user_monthly_count() {
        let db = KilnDb::open_in_memory().unwrap();
        let mut charge = make_charge("a", 5.0, false);
        charge.user_email = Some("user@example.com".into());
        db.save_billing_charge(&charge).unwrap();
        db.save_billing_charge(&make_charge("b", 5.0, false)).unwrap();
        db.set_charge_user("b", "user@example.com").unwrap();

        assert_eq!(db.charges_this_month_for_user("user@example.com").unwrap(), 2);
        assert_eq!(db.charges_this_month_for_user("other@example.com").unwrap(), 0);
    }

    #[test]
    fn payments_and_methods_round_trip() {
        let db = KilnDb::open_in_memory().unwrap();
        db.save_payment(&PaymentRecord {
            payment_id: "pi_1".into(),
            job_id: "job-1".into(),
            rail: "stripe".into(),
            amount: 5.0,
            currency: "USD".into(),
            status: "completed".into(),
            tx_hash: None,
            created_at: now_ts(),
        })
        .unwrap();
        db.update_payment_status("pi_1", "refunded", Some("0xabc")).unwrap();

        db.save_payment_method(&PaymentMethodRecord {
            id: "pm_1".into(),
            user_id: "user-1".into(),
            rail: "stripe".into(),
            provider_ref: "cus_123".into(),
            label: "Visa *4242".into(),
            is_default: true,
            created_at: now_ts(),
        })
        .unwrap();

        let methods = db.list_payment_methods("user-1").unwrap();
        assert_eq!(methods.len(), 1);
        let default = db.get_default_payment_method("user-1").unwrap().unwrap();
        assert_eq!(default.label, "Visa *4242");
        assert!(db.get_default_payment_method("user-2").unwrap().is_none());
    }

    #[test]
    fn print_dna_query_paths() {
        let db = KilnDb::open_in_memory().unwrap();
        let row = PrintDnaRow {
            file_hash: "abc".into(),
            geometric_signature: "sig-1".into(),
            triangle_count: 100,
            bbox_mm: (60.0, 31.0, 48.0),
            volume_mm3: 15_500.0,
            surface_area_mm2: 9_800.0,
            printer_model: "voron-2.4".into(),
            material: "PLA".into(),
            settings: Map::new(),
            outcome: "success".into(),
            quality_grade: Some("A".into()),
            failure_mode: None,
            print_time_s: Some(5_400.0),
            timestamp: now_ts(),
        };
        db.insert_print_dna(&row).unwrap();
        db.insert_print_dna(&row).unwrap();

        assert_eq!(db.print_dna_by_hash("abc", 10).unwrap().len(), 2);
        assert_eq!(db.print_dna_by_signature("sig-1", 1).unwrap().len(), 1);
        assert!(db.print_dna_by_hash("zzz", 10).unwrap().is_empty());
    }
}
