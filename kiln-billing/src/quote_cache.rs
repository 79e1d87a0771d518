//! TTL-keyed dedup cache for external manufacturing quotes.
//!
//! Agents frequently ask for quotes on the same provider/material/quantity
//! combination; this cache serves repeats from memory (or optional SQLite
//! persistence) instead of hitting external APIs. TTL resolution order:
//! provider override, then service override, then the default (overridable
//! via `KILN_QUOTE_CACHE_TTL`).

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::now_ts;

/// A cached manufacturing quote with expiry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuote {
    pub quote_id: String,
    pub provider_name: String,
    pub service_type: String,
    pub material: String,
    pub quantity: u32,
    pub quoted_price: f64,
    pub currency: String,
    pub lead_time_days: u32,
    pub cached_at: f64,
    pub expires_at: f64,
    /// SHA-256 dedup key derived from the quote parameters.
    pub cache_key: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CachedQuote {
    pub fn is_expired(&self) -> bool {
        now_ts() >= self.expires_at
    }
}

/// TTL and size limits.
#[derive(Debug, Clone)]
pub struct QuoteCacheConfig {
    pub default_ttl_seconds: u64,
    pub max_entries: usize,
    pub ttl_by_provider: HashMap<String, u64>,
    pub ttl_by_service: HashMap<String, u64>,
}

impl Default for QuoteCacheConfig {
    fn default() -> Self {
        let default_ttl_seconds = std::env::var("KILN_QUOTE_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        Self {
            default_ttl_seconds,
            max_entries: 1000,
            ttl_by_provider: HashMap::new(),
            ttl_by_service: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
}

struct CacheState {
    entries: HashMap<String, CachedQuote>,
    stats: CacheStats,
    conn: Option<Connection>,
}

/// In-memory quote cache with optional durable backing.
pub struct QuoteCache {
    config: QuoteCacheConfig,
    state: Mutex<CacheState>,
}

impl QuoteCache {
    pub fn new(config: QuoteCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                conn: None,
            }),
        }
    }

    /// Open with a SQLite backing file; unexpired rows are loaded into
    /// memory at startup.
    pub fn with_store(config: QuoteCacheConfig, db_path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS quote_cache (
                cache_key       TEXT PRIMARY KEY,
                quote_id        TEXT NOT NULL,
                provider_name   TEXT NOT NULL,
                service_type    TEXT NOT NULL,
                material        TEXT NOT NULL,
                quantity        INTEGER NOT NULL,
                quoted_price    REAL NOT NULL,
                currency        TEXT NOT NULL,
                lead_time_days  INTEGER NOT NULL,
                cached_at       REAL NOT NULL,
                expires_at      REAL NOT NULL,
                metadata_json   TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_qc_provider ON quote_cache(provider_name);
            CREATE INDEX IF NOT EXISTS idx_qc_expires ON quote_cache(expires_at);",
        )?;

        let mut entries = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT * FROM quote_cache WHERE expires_at > ?1")?;
            let rows = stmt.query_map(params![now_ts()], |row| {
                let metadata_json: String = row.get("metadata_json")?;
                Ok(CachedQuote {
                    cache_key: row.get("cache_key")?,
                    quote_id: row.get("quote_id")?,
                    provider_name: row.get("provider_name")?,
                    service_type: row.get("service_type")?,
                    material: row.get("material")?,
                    quantity: row.get::<_, i64>("quantity")? as u32,
                    quoted_price: row.get("quoted_price")?,
                    currency: row.get("currency")?,
                    lead_time_days: row.get::<_, i64>("lead_time_days")? as u32,
                    cached_at: row.get("cached_at")?,
                    expires_at: row.get("expires_at")?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                })
            })?;
            for row in rows {
                let quote = row?;
                entries.insert(quote.cache_key.clone(), quote);
            }
        }

        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries,
                stats: CacheStats::default(),
                conn: Some(conn),
            }),
        })
    }

    fn cache_key(provider: &str, service_type: &str, material: &str, quantity: u32) -> String {
        let raw = format!(
            "{}|{}|{}|{quantity}",
            provider.to_lowercase().trim(),
            service_type.to_lowercase().trim(),
            material.to_lowercase().trim(),
        );
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    fn ttl_for(&self, provider: &str, service_type: &str) -> u64 {
        if let Some(ttl) = self.config.ttl_by_provider.get(provider) {
            return *ttl;
        }
        if let Some(ttl) = self.config.ttl_by_service.get(service_type) {
            return *ttl;
        }
        self.config.default_ttl_seconds
    }

    fn persist(conn: &Option<Connection>, quote: &CachedQuote) {
        let Some(conn) = conn else { return };
        let metadata = serde_json::to_string(&quote.metadata).unwrap_or_else(|_| "{}".into());
        if let Err(err) = conn.execute(
            "INSERT OR REPLACE INTO quote_cache
                 (cache_key, quote_id, provider_name, service_type, material, quantity,
                  quoted_price, currency, lead_time_days, cached_at, expires_at, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                quote.cache_key,
                quote.quote_id,
                quote.provider_name,
                quote.service_type,
                quote.material,
                quote.quantity,
                quote.quoted_price,
                quote.currency,
                quote.lead_time_days,
                quote.cached_at,
                quote.expires_at,
                metadata,
            ],
        ) {
            tracing::warn!(error = %err, "failed to persist cached quote");
        }
    }

    fn delete_row(conn: &Option<Connection>, cache_key: &str) {
        if let Some(conn) = conn {
            let _ = conn.execute("DELETE FROM quote_cache WHERE cache_key = ?1", params![cache_key]);
        }
    }

    /// Cache a quote; returns the cached entry.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        provider: &str,
        service_type: &str,
        material: &str,
        quantity: u32,
        price: f64,
        currency: &str,
        lead_time_days: u32,
        metadata: Map<String, Value>,
    ) -> CachedQuote {
        let cache_key = Self::cache_key(provider, service_type, material, quantity);
        let ttl = self.ttl_for(provider, service_type);
        let now = now_ts();
        let quote = CachedQuote {
            quote_id: Uuid::new_v4().to_string(),
            provider_name: provider.to_string(),
            service_type: service_type.to_string(),
            material: material.to_string(),
            quantity,
            quoted_price: price,
            currency: currency.to_string(),
            lead_time_days,
            cached_at: now,
            expires_at: now + ttl as f64,
            cache_key: cache_key.clone(),
            metadata,
        };

        let mut state = self.state.lock();
        state.entries.insert(cache_key, quote.clone());
        // Evict oldest entries beyond the size cap.
        while state.entries.len() > self.config.max_entries {
            let oldest = state
                .entries
                .values()
                .min_by(|a, b| {
                    a.cached_at
                        .partial_cmp(&b.cached_at)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|q| q.cache_key.clone());
            let Some(key) = oldest else { break };
            state.entries.remove(&key);
            Self::delete_row(&state.conn, &key);
        }
        Self::persist(&state.conn, &quote);
        quote
    }

    /// Fetch a quote when present and unexpired; expired entries are
    /// auto-cleaned on the way out.
    pub fn get(
        &self,
        provider: &str,
        service_type: &str,
        material: &str,
        quantity: u32,
    ) -> Option<CachedQuote> {
        let cache_key = Self::cache_key(provider, service_type, material, quantity);
        let mut state = self.state.lock();
        match state.entries.get(&cache_key) {
            Some(quote) if !quote.is_expired() => {
                let quote = quote.clone();
                state.stats.hits += 1;
                Some(quote)
            }
            Some(_) => {
                state.entries.remove(&cache_key);
                Self::delete_row(&state.conn, &cache_key);
                state.stats.misses += 1;
                None
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Look up by the generated quote id. Does not auto-evict expired
    /// entries; the caller decides how to treat expiry.
    pub fn get_by_quote_id(&self, quote_id: &str) -> Option<CachedQuote> {
        self.state
            .lock()
            .entries
            .values()
            .find(|q| q.quote_id == quote_id)
            .cloned()
    }

    /// All unexpired quotes for a service type, for cross-provider
    /// comparison.
    pub fn all_for_service(&self, service_type: &str) -> Vec<CachedQuote> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|q| q.service_type == service_type && q.is_expired())
            .map(|q| q.cache_key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
            Self::delete_row(&state.conn, key);
        }
        state
            .entries
            .values()
            .filter(|q| q.service_type == service_type)
            .cloned()
            .collect()
    }

    /// Drop all quotes for one provider; returns the number removed.
    pub fn invalidate_provider(&self, provider: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .values()
            .filter(|q| q.provider_name == provider)
            .map(|q| q.cache_key.clone())
            .collect();
        for key in &keys {
            state.entries.remove(key);
        }
        if let Some(conn) = &state.conn {
            let _ = conn.execute(
                "DELETE FROM quote_cache WHERE provider_name = ?1",
                params![provider],
            );
        }
        keys.len()
    }

    /// Remove expired entries; returns the number removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|q| q.is_expired())
            .map(|q| q.cache_key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
            Self::delete_row(&state.conn, key);
        }
        expired.len()
    }

    /// Cache statistics: totals, per-provider counts, and hit rate.
    pub fn stats(&self) -> Value {
        let state = self.state.lock();
        let mut by_provider: HashMap<String, usize> = HashMap::new();
        for quote in state.entries.values() {
            *by_provider.entry(quote.provider_name.clone()).or_default() += 1;
        }
        let total_requests = state.stats.hits + state.stats.misses;
        serde_json::json!({
            "total": state.entries.len(),
            "expired": state.entries.values().filter(|q| q.is_expired()).count(),
            "by_provider": by_provider,
            "hits": state.stats.hits,
            "misses": state.stats.misses,
            "hit_rate": if total_requests > 0 {
                state.stats.hits as f64 / total_requests as f64
            } else {
                0.0
            },
        })
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new(QuoteCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_default(cache: &QuoteCache, provider: &str, qty: u32) -> CachedQuote {
        cache.put(
            provider,
            "fdm_printing",
            "pla_white",
            qty,
            42.0,
            "USD",
            5,
            Map::new(),
        )
    }

    #[test]
    fn put_then_get_hits() {
        let cache = QuoteCache::default();
        let quote = put_default(&cache, "sculpteo", 10);
        let fetched = cache
            .get("sculpteo", "fdm_printing", "pla_white", 10)
            .unwrap();
        assert_eq!(fetched.quote_id, quote.quote_id);
        assert_eq!(fetched.quoted_price, 42.0);
    }

    #[test]
    fn key_is_case_insensitive_and_quantity_scoped() {
        let cache = QuoteCache::default();
        put_default(&cache, "Sculpteo", 10);
        assert!(cache.get("sculpteo", "FDM_Printing", "PLA_WHITE", 10).is_some());
        assert!(cache.get("sculpteo", "fdm_printing", "pla_white", 11).is_none());
    }

    #[test]
    fn ttl_resolution_order() {
        let mut config = QuoteCacheConfig {
            default_ttl_seconds: 100,
            ..QuoteCacheConfig::default()
        };
        config.ttl_by_service.insert("fdm_printing".into(), 200);
        config.ttl_by_provider.insert("sculpteo".into(), 300);
        let cache = QuoteCache::new(config);

        let provider_quote = put_default(&cache, "sculpteo", 1);
        assert!((provider_quote.expires_at - provider_quote.cached_at - 300.0).abs() < 1.0);

        let service_quote = put_default(&cache, "craftcloud", 1);
        assert!((service_quote.expires_at - service_quote.cached_at - 200.0).abs() < 1.0);

        let default_quote = cache.put(
            "craftcloud", "sls_printing", "nylon", 1, 10.0, "USD", 7, Map::new(),
        );
        assert!((default_quote.expires_at - default_quote.cached_at - 100.0).abs() < 1.0);
    }

    #[test]
    fn expired_entries_evict_on_read() {
        let cache = QuoteCache::new(QuoteCacheConfig {
            default_ttl_seconds: 0,
            ..QuoteCacheConfig::default()
        });
        put_default(&cache, "sculpteo", 1);
        assert!(cache.get("sculpteo", "fdm_printing", "pla_white", 1).is_none());
        let stats = cache.stats();
        assert_eq!(stats["total"], 0);
        assert_eq!(stats["misses"], 1);
    }

    #[test]
    fn max_entries_evicts_oldest() {
        let cache = QuoteCache::new(QuoteCacheConfig {
            max_entries: 2,
            ..QuoteCacheConfig::default()
        });
        put_default(&cache, "a", 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        put_default(&cache, "b", 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        put_default(&cache, "c", 1);

        assert!(cache.get("a", "fdm_printing", "pla_white", 1).is_none());
        assert!(cache.get("b", "fdm_printing", "pla_white", 1).is_some());
        assert!(cache.get("c", "fdm_printing", "pla_white", 1).is_some());
    }

    #[test]
    fn lookup_by_quote_id() {
        let cache = QuoteCache::default();
        let quote = put_default(&cache, "sculpteo", 2);
        assert!(cache.get_by_quote_id(&quote.quote_id).is_some());
        assert!(cache.get_by_quote_id("nope").is_none());
    }

    #[test]
    fn invalidate_provider_counts() {
        let cache = QuoteCache::default();
        put_default(&cache, "sculpteo", 1);
        put_default(&cache, "sculpteo", 2);
        put_default(&cache, "craftcloud", 1);
        assert_eq!(cache.invalidate_provider("sculpteo"), 2);
        assert!(cache.get("craftcloud", "fdm_printing", "pla_white", 1).is_some());
    }

    #[test]
    fn durable_backing_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotes.db");
        {
            let cache = QuoteCache::with_store(QuoteCacheConfig::default(), &path).unwrap();
            put_default(&cache, "sculpteo", 10);
        }
        let cache = QuoteCache::with_store(QuoteCacheConfig::default(), &path).unwrap();
        let fetched = cache.get("sculpteo", "fdm_printing", "pla_white", 10);
        assert!(fetched.is_some());
    }

    #[test]
    fn stats_track_hit_rate() {
        let cache = QuoteCache::default();
        put_default(&cache, "sculpteo", 1);
        cache.get("sculpteo", "fdm_printing", "pla_white", 1);
        cache.get("sculpteo", "fdm_printing", "pla_white", 99);
        let stats = cache.stats();
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["hit_rate"], 0.5);
    }
}
