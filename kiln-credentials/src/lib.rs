//! Encrypted credential storage for the Kiln multi-printer system.
//!
//! Provides at-rest encryption for API keys, webhook secrets, and payment
//! provider keys using PBKDF2 key derivation plus authenticated encryption
//! (AES-256-GCM).
//!
//! Legacy PBKDF2+XOR rows are still readable; they are migrated to AES-GCM
//! transparently on retrieval and during master-key rotation.
//!
//! The master key is sourced from (in order): the constructor argument, the
//! `KILN_MASTER_KEY` environment variable, or an auto-generated key
//! persisted to `~/.kiln/master.key` with a warning.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac_array;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;
const ENC_VERSION_PREFIX: &str = "v2:";

/// Result type for credential store operations.
pub type CredentialResult<T> = Result<T, CredentialStoreError>;

/// Errors surfaced by the credential store.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("credential {0:?} not found")]
    NotFound(String),

    #[error("decryption failed — wrong master key or corrupted credential")]
    DecryptionFailed,

    #[error("decryption failed — malformed ciphertext")]
    MalformedCiphertext,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store path error: {0}")]
    Path(String),
}

/// Types of credentials that can be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    WebhookSecret,
    StripeKey,
    CircleKey,
    MarketplaceToken,
    PrinterPassword,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::ApiKey => "api_key",
            CredentialType::WebhookSecret => "webhook_secret",
            CredentialType::StripeKey => "stripe_key",
            CredentialType::CircleKey => "circle_key",
            CredentialType::MarketplaceToken => "marketplace_token",
            CredentialType::PrinterPassword => "printer_password",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "webhook_secret" => CredentialType::WebhookSecret,
            "stripe_key" => CredentialType::StripeKey,
            "circle_key" => CredentialType::CircleKey,
            "marketplace_token" => CredentialType::MarketplaceToken,
            "printer_password" => CredentialType::PrinterPassword,
            _ => CredentialType::ApiKey,
        }
    }
}

/// Metadata for a stored credential. Never contains the decrypted value.
#[derive(Debug, Clone)]
pub struct EncryptedCredential {
    pub credential_id: String,
    pub credential_type: CredentialType,
    /// `"v2:" + base64(nonce ‖ ciphertext+tag)` (internal use only).
    pub encrypted_value: String,
    /// Base64 salt used during key derivation (internal use only).
    pub salt: String,
    pub created_at: f64,
    pub label: String,
}

/// Serializable summary of a credential. Ciphertext and salt are
/// intentionally excluded so this can be returned to callers and logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub credential_id: String,
    pub credential_type: CredentialType,
    pub created_at: f64,
    pub label: String,
}

impl EncryptedCredential {
    /// The leak-safe view of this credential.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            credential_id: self.credential_id.clone(),
            credential_type: self.credential_type,
            created_at: self.created_at,
            label: self.label.clone(),
        }
    }
}

/// Encrypted credential storage backed by SQLite.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    master_key: Mutex<String>,
    path: PathBuf,
}

impl CredentialStore {
    /// Open (or create) the store. `master_key` falls back to
    /// `KILN_MASTER_KEY`, then to an auto-generated persisted key;
    /// `db_path` falls back to `KILN_CREDENTIAL_DB_PATH`, then to
    /// `~/.kiln/credentials.db`.
    pub fn open(master_key: Option<&str>, db_path: Option<&Path>) -> CredentialResult<Self> {
        let path = match db_path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("KILN_CREDENTIAL_DB_PATH") {
                Ok(p) if !p.is_empty() => PathBuf::from(p),
                _ => kiln_home()?.join("credentials.db"),
            },
        };
        let key = resolve_master_key(master_key)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                credential_id    TEXT PRIMARY KEY,
                credential_type  TEXT NOT NULL,
                encrypted_value  TEXT NOT NULL,
                salt             TEXT NOT NULL,
                created_at       REAL NOT NULL,
                label            TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            master_key: Mutex::new(key),
            path,
        };
        store.enforce_permissions();
        Ok(store)
    }

    /// Filesystem path of the backing database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn enforce_permissions(&self) {
        use std::os::unix::fs::PermissionsExt;
        if let Some(dir) = self.path.parent() {
            if let Err(err) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            {
                tracing::warn!(path = %dir.display(), error = %err, "unable to set permissions");
            }
        }
        if let Err(err) =
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::warn!(path = %self.path.display(), error = %err, "unable to set permissions");
        }
    }

    #[cfg(not(unix))]
    fn enforce_permissions(&self) {}

    // ------------------------------------------------------------------
    // Cryptographic helpers
    // ------------------------------------------------------------------

    fn derive_key(master_key: &str, salt: &[u8]) -> [u8; KEY_LENGTH] {
        pbkdf2_hmac_array::<Sha256, KEY_LENGTH>(master_key.as_bytes(), salt, PBKDF2_ITERATIONS)
    }

    fn encrypt_with(master_key: &str, plaintext: &str, salt: &[u8]) -> CredentialResult<Vec<u8>> {
        let key = Self::derive_key(master_key, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CredentialStoreError::DecryptionFailed)?;
        let mut payload = Vec::with_capacity(NONCE_LENGTH + ct.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ct);
        Ok(payload)
    }

    fn decrypt_with(master_key: &str, payload: &[u8], salt: &[u8]) -> CredentialResult<String> {
        // Nonce plus at least the 16-byte GCM tag.
        if payload.len() < NONCE_LENGTH + 16 {
            return Err(CredentialStoreError::MalformedCiphertext);
        }
        let key = Self::derive_key(master_key, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
        let nonce = Nonce::from_slice(&payload[..NONCE_LENGTH]);
        let pt = cipher
            .decrypt(nonce, &payload[NONCE_LENGTH..])
            .map_err(|_| CredentialStoreError::DecryptionFailed)?;
        String::from_utf8(pt).map_err(|_| CredentialStoreError::DecryptionFailed)
    }

    /// Legacy PBKDF2+XOR scheme, kept only for migration of old rows.
    fn xor_keystream(master_key: &str, data: &[u8], salt: &[u8]) -> Vec<u8> {
        let key = Self::derive_key(master_key, salt);
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }

    fn decrypt_legacy(master_key: &str, payload: &[u8], salt: &[u8]) -> CredentialResult<String> {
        let pt = Self::xor_keystream(master_key, payload, salt);
        String::from_utf8(pt).map_err(|_| CredentialStoreError::DecryptionFailed)
    }

    fn encode_payload(payload: &[u8]) -> String {
        format!("{ENC_VERSION_PREFIX}{}", BASE64.encode(payload))
    }

    /// Decode a stored value to `(payload, is_v2)`.
    fn decode_stored(encrypted_value: &str) -> CredentialResult<(Vec<u8>, bool)> {
        if let Some(b64) = encrypted_value.strip_prefix(ENC_VERSION_PREFIX) {
            let payload = BASE64
                .decode(b64)
                .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
            return Ok((payload, true));
        }
        let payload = BASE64
            .decode(encrypted_value)
            .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
        Ok((payload, false))
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Encrypt and store a credential; returns metadata only.
    pub fn store(
        &self,
        credential_type: CredentialType,
        value: &str,
        label: &str,
    ) -> CredentialResult<EncryptedCredential> {
        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let credential_id = hex::encode(id_bytes);

        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);

        let master = self.master_key.lock().clone();
        let payload = Self::encrypt_with(&master, value, &salt)?;
        let encrypted_value = Self::encode_payload(&payload);
        let salt_b64 = BASE64.encode(salt);
        let created_at = now_ts();

        self.conn.lock().execute(
            "INSERT INTO credentials
                 (credential_id, credential_type, encrypted_value, salt, created_at, label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                credential_id,
                credential_type.as_str(),
                encrypted_value,
                salt_b64,
                created_at,
                label,
            ],
        )?;

        Ok(EncryptedCredential {
            credential_id,
            credential_type,
            encrypted_value,
            salt: salt_b64,
            created_at,
            label: label.to_string(),
        })
    }

    /// Decrypt and return the plaintext for `credential_id`.
    ///
    /// Legacy rows are re-encrypted in place to the v2 format on first
    /// read. Two readers racing on the same legacy row both decrypt the
    /// same plaintext; last migration write wins.
    pub fn retrieve(&self, credential_id: &str) -> CredentialResult<String> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT encrypted_value, salt FROM credentials WHERE credential_id = ?1",
                params![credential_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (encrypted_value, salt_b64) =
            row.ok_or_else(|| CredentialStoreError::NotFound(credential_id.to_string()))?;

        let (payload, is_v2) = Self::decode_stored(&encrypted_value)?;
        let salt = BASE64
            .decode(&salt_b64)
            .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
        let master = self.master_key.lock().clone();

        if is_v2 {
            return Self::decrypt_with(&master, &payload, &salt);
        }

        let plaintext = Self::decrypt_legacy(&master, &payload, &salt)?;
        self.migrate_legacy_row(credential_id, &plaintext)?;
        Ok(plaintext)
    }

    fn migrate_legacy_row(&self, credential_id: &str, plaintext: &str) -> CredentialResult<()> {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let master = self.master_key.lock().clone();
        let payload = Self::encrypt_with(&master, plaintext, &salt)?;
        self.conn.lock().execute(
            "UPDATE credentials SET encrypted_value = ?1, salt = ?2 WHERE credential_id = ?3",
            params![Self::encode_payload(&payload), BASE64.encode(salt), credential_id],
        )?;
        tracing::debug!(credential_id, "migrated legacy credential to AES-GCM");
        Ok(())
    }

    /// Delete a credential; `true` if a row was removed.
    pub fn delete(&self, credential_id: &str) -> CredentialResult<bool> {
        let count = self.conn.lock().execute(
            "DELETE FROM credentials WHERE credential_id = ?1",
            params![credential_id],
        )?;
        Ok(count > 0)
    }

    /// Metadata for every stored credential, newest first.
    pub fn list_credentials(&self) -> CredentialResult<Vec<EncryptedCredential>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM credentials ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            let ty: String = row.get("credential_type")?;
            Ok(EncryptedCredential {
                credential_id: row.get("credential_id")?,
                credential_type: CredentialType::parse(&ty),
                encrypted_value: row.get("encrypted_value")?,
                salt: row.get("salt")?,
                created_at: row.get("created_at")?,
                label: row.get("label")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Re-encrypt every credential under `new_master_key`.
    ///
    /// All rows are decrypted under the old key in memory first; any
    /// failure aborts before a single row is written. The rewrite happens
    /// in one transaction. Returns the number of re-encrypted rows.
    pub fn rotate_master_key(&self, new_master_key: &str) -> CredentialResult<usize> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT credential_id, encrypted_value, salt FROM credentials")?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            out
        };

        let old_key = self.master_key.lock().clone();
        let mut re_encrypted: Vec<(String, String, String)> = Vec::with_capacity(rows.len());

        for (credential_id, encrypted_value, salt_b64) in rows {
            let (payload, is_v2) = Self::decode_stored(&encrypted_value)?;
            let old_salt = BASE64
                .decode(&salt_b64)
                .map_err(|_| CredentialStoreError::MalformedCiphertext)?;
            let plaintext = if is_v2 {
                Self::decrypt_with(&old_key, &payload, &old_salt)?
            } else {
                Self::decrypt_legacy(&old_key, &payload, &old_salt)?
            };

            let mut new_salt = [0u8; SALT_LENGTH];
            OsRng.fill_bytes(&mut new_salt);
            let new_payload = Self::encrypt_with(new_master_key, &plaintext, &new_salt)?;
            re_encrypted.push((
                Self::encode_payload(&new_payload),
                BASE64.encode(new_salt),
                credential_id,
            ));
        }

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for (enc, salt, id) in &re_encrypted {
                tx.execute(
                    "UPDATE credentials SET encrypted_value = ?1, salt = ?2
                     WHERE credential_id = ?3",
                    params![enc, salt, id],
                )?;
            }
            tx.commit()?;
        }

        *self.master_key.lock() = new_master_key.to_string();
        Ok(re_encrypted.len())
    }

    /// Test-only: write a row in the legacy XOR format.
    #[doc(hidden)]
    pub fn store_legacy_for_tests(
        &self,
        credential_type: CredentialType,
        value: &str,
        label: &str,
    ) -> CredentialResult<String> {
        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let credential_id = hex::encode(id_bytes);
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let master = self.master_key.lock().clone();
        let payload = Self::xor_keystream(&master, value.as_bytes(), &salt);
        self.conn.lock().execute(
            "INSERT INTO credentials
                 (credential_id, credential_type, encrypted_value, salt, created_at, label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                credential_id,
                credential_type.as_str(),
                BASE64.encode(payload),
                BASE64.encode(salt),
                now_ts(),
                label,
            ],
        )?;
        Ok(credential_id)
    }
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn kiln_home() -> CredentialResult<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CredentialStoreError::Path("HOME is not set".into()))?;
    Ok(home.join(".kiln"))
}

/// Resolve the master key: explicit > `KILN_MASTER_KEY` > generated file.
fn resolve_master_key(explicit: Option<&str>) -> CredentialResult<String> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    if let Ok(key) = std::env::var("KILN_MASTER_KEY") {
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let key_path = kiln_home()?.join("master.key");
    if key_path.is_file() {
        let stored = std::fs::read_to_string(&key_path)?;
        let stored = stored.trim();
        if !stored.is_empty() {
            return Ok(stored.to_string());
        }
    }

    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut raw = [0u8; 48];
    OsRng.fill_bytes(&mut raw);
    let generated = BASE64_URL.encode(raw);
    std::fs::write(&key_path, &generated)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }
    tracing::warn!(
        path = %key_path.display(),
        "no master key provided; auto-generated one — back up this file, losing it \
         means losing access to all encrypted credentials"
    );
    Ok(generated)
}
