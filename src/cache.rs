//! SQLite-backed cache for resolved addresses plus the failure ledger.
//!
//! This is what makes batches resumable: a second run over the same input
//! only re-scrapes addresses that never resolved. Expiry is lazy — readers
//! check `expires_at`; nothing sweeps the table.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::CACHE_TTL_DAYS;
use crate::models::{AgentInfo, LookupStatus};

/// Timestamp format stored in the database. Lexicographic comparison of
/// these strings matches chronological order, which the expiry queries
/// rely on.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn now_stamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Cache statistics returned by `/api/cache/stats`.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheStats {
    pub cached_results: u64,
    pub recorded_failures: u64,
}

/// A full cached row, used for export.
#[derive(Clone, Debug, Serialize)]
pub struct CachedResult {
    pub raw_address: String,
    pub status: String,
    pub scraped_at: String,
    #[serde(flatten)]
    pub agent_info: AgentInfo,
}

/// SQLite-backed scrape cache. Cheap to clone; connections are opened per
/// operation on the blocking pool so cache calls stay suspension points.
#[derive(Clone)]
pub struct ScrapeCache {
    db_path: PathBuf,
    ttl: Duration,
}

impl ScrapeCache {
    pub fn new(db_path: impl AsRef<Path>, ttl_days: i64) -> ScrapeCache {
        ScrapeCache {
            db_path: db_path.as_ref().to_owned(),
            ttl: Duration::days(ttl_days),
        }
    }

    pub fn with_default_ttl(db_path: impl AsRef<Path>) -> ScrapeCache {
        ScrapeCache::new(db_path, CACHE_TTL_DAYS)
    }

    /// Consistent hash for an address string. Uppercased and trimmed so
    /// trivially different spellings share an entry.
    pub fn address_hash(address: &str) -> String {
        let normalized = address.trim().to_uppercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .with_context(|| format!("cannot open cache db {}", path.display()))?;
            f(&mut conn)
        })
        .await
        .context("cache task panicked")?
    }

    /// Create tables if they don't exist, and patch older databases that
    /// predate the listing metadata columns.
    pub async fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS results (
                    address_hash TEXT PRIMARY KEY,
                    raw_address TEXT NOT NULL,
                    agent_name TEXT DEFAULT '',
                    brokerage TEXT DEFAULT '',
                    phone TEXT DEFAULT '',
                    email TEXT DEFAULT '',
                    source TEXT DEFAULT '',
                    listing_url TEXT DEFAULT '',
                    list_date TEXT DEFAULT '',
                    days_on_market TEXT DEFAULT '',
                    status TEXT DEFAULT 'found',
                    scraped_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS failures (
                    address_hash TEXT PRIMARY KEY,
                    raw_address TEXT NOT NULL,
                    sources_tried TEXT DEFAULT '[]',
                    error TEXT DEFAULT '',
                    attempts INTEGER DEFAULT 1,
                    last_attempt TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_results_address
                    ON results(raw_address);",
            )?;

            // Best-effort migrations for stores created before these columns
            // existed; the error on an already-present column is expected.
            for migration in [
                "ALTER TABLE results ADD COLUMN list_date TEXT DEFAULT ''",
                "ALTER TABLE results ADD COLUMN days_on_market TEXT DEFAULT ''",
            ] {
                let _ = conn.execute(migration, []);
            }
            Ok(())
        })
        .await
    }

    /// Get cached agent info for an address, if present and not expired.
    pub async fn get(&self, address: &str) -> Result<Option<AgentInfo>> {
        let hash = Self::address_hash(address);
        let result = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT agent_name, brokerage, phone, email, source,
                                listing_url, list_date, days_on_market
                         FROM results WHERE address_hash = ?1 AND expires_at > ?2",
                        params![hash, now_stamp()],
                        |row| {
                            Ok(AgentInfo {
                                agent_name: row.get(0)?,
                                brokerage: row.get(1)?,
                                phone: row.get(2)?,
                                email: row.get(3)?,
                                source: row.get(4)?,
                                listing_url: row.get(5)?,
                                list_date: row.get(6)?,
                                days_on_market: row.get(7)?,
                                listing_price: String::new(),
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        if result.is_some() {
            counter!("agentfinder.cache_hits.total", 1);
        } else {
            counter!("agentfinder.cache_misses.total", 1);
        }
        Ok(result)
    }

    /// Cache a successful scrape, clearing any failure record for the same
    /// address in the same transaction.
    pub async fn put(
        &self,
        address: &str,
        agent_info: &AgentInfo,
        status: LookupStatus,
    ) -> Result<()> {
        let hash = Self::address_hash(address);
        let address = address.to_owned();
        let info = agent_info.clone();
        let ttl = self.ttl;
        self.with_conn(move |conn| {
            let now = Utc::now();
            let expires = now + ttl;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO results
                   (address_hash, raw_address, agent_name, brokerage, phone, email,
                    source, listing_url, list_date, days_on_market,
                    status, scraped_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    hash,
                    address,
                    info.agent_name,
                    info.brokerage,
                    info.phone,
                    info.email,
                    info.source,
                    info.listing_url,
                    info.list_date,
                    info.days_on_market,
                    status.to_string(),
                    now.format(TIMESTAMP_FORMAT).to_string(),
                    expires.format(TIMESTAMP_FORMAT).to_string(),
                ],
            )?;
            tx.execute(
                "DELETE FROM failures WHERE address_hash = ?1",
                params![hash],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Record a failed lookup; repeat failures increment the attempt count.
    pub async fn record_failure(
        &self,
        address: &str,
        sources_tried: &[String],
        error: &str,
    ) -> Result<()> {
        let hash = Self::address_hash(address);
        let address = address.to_owned();
        let sources_json = serde_json::to_string(sources_tried)?;
        let error = error.to_owned();
        self.with_conn(move |conn| {
            let now = now_stamp();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT attempts FROM failures WHERE address_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                conn.execute(
                    "UPDATE failures SET sources_tried = ?1, error = ?2,
                        attempts = attempts + 1, last_attempt = ?3
                     WHERE address_hash = ?4",
                    params![sources_json, error, now, hash],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO failures
                       (address_hash, raw_address, sources_tried, error, attempts, last_attempt)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![hash, address, sources_json, error, now],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Of `all_addresses`, the ones not currently resolved (for resume).
    pub async fn pending_addresses(&self, all_addresses: &[String]) -> Result<Vec<String>> {
        let all = all_addresses.to_vec();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT address_hash FROM results WHERE expires_at > ?1")?;
            let cached: std::collections::HashSet<String> = stmt
                .query_map(params![now_stamp()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?;
            Ok(all
                .into_iter()
                .filter(|addr| !cached.contains(&Self::address_hash(addr)))
                .collect())
        })
        .await
    }

    /// All non-expired cached results, for export.
    pub async fn all_results(&self) -> Result<Vec<CachedResult>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT raw_address, agent_name, brokerage, phone, email, source,
                        listing_url, list_date, days_on_market, status, scraped_at
                 FROM results WHERE expires_at > ?1",
            )?;
            let rows = stmt
                .query_map(params![now_stamp()], |row| {
                    Ok(CachedResult {
                        raw_address: row.get(0)?,
                        agent_info: AgentInfo {
                            agent_name: row.get(1)?,
                            brokerage: row.get(2)?,
                            phone: row.get(3)?,
                            email: row.get(4)?,
                            source: row.get(5)?,
                            listing_url: row.get(6)?,
                            list_date: row.get(7)?,
                            days_on_market: row.get(8)?,
                            listing_price: String::new(),
                        },
                        status: row.get(9)?,
                        scraped_at: row.get(10)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.with_conn(move |conn| {
            let cached: u64 = conn.query_row(
                "SELECT COUNT(*) FROM results WHERE expires_at > ?1",
                params![now_stamp()],
                |row| row.get(0),
            )?;
            let failed: u64 =
                conn.query_row("SELECT COUNT(*) FROM failures", [], |row| row.get(0))?;
            Ok(CacheStats {
                cached_results: cached,
                recorded_failures: failed,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_cache(ttl_days: i64) -> (tempfile::TempDir, ScrapeCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScrapeCache::new(dir.path().join("cache.db"), ttl_days);
        (dir, cache)
    }

    fn sample_info() -> AgentInfo {
        AgentInfo {
            agent_name: "Jane Doe".to_owned(),
            brokerage: "ABC Realty".to_owned(),
            phone: "(555) 111-2222".to_owned(),
            source: "redfin".to_owned(),
            ..AgentInfo::default()
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, cache) = scratch_cache(7);
        cache.initialize().await.unwrap();

        let addr = "123 MAIN ST, SPRINGFIELD, IL 62704";
        cache
            .put(addr, &sample_info(), LookupStatus::Found)
            .await
            .unwrap();

        let got = cache.get(addr).await.unwrap().unwrap();
        assert_eq!(got.agent_name, "Jane Doe");
        assert_eq!(got.phone, "(555) 111-2222");

        // Hashing is case-insensitive.
        let got = cache
            .get("123 main st, springfield, il 62704")
            .await
            .unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let (_dir, cache) = scratch_cache(-1);
        cache.initialize().await.unwrap();
        let addr = "1 EXPIRED LN";
        cache
            .put(addr, &sample_info(), LookupStatus::Found)
            .await
            .unwrap();
        assert!(cache.get(addr).await.unwrap().is_none());
        // And it stays in the pending set.
        let pending = cache
            .pending_addresses(&[addr.to_owned()])
            .await
            .unwrap();
        assert_eq!(pending, vec![addr.to_owned()]);
    }

    #[tokio::test]
    async fn successful_put_clears_failure() {
        let (_dir, cache) = scratch_cache(7);
        cache.initialize().await.unwrap();

        let addr = "456 OAK AVE";
        cache
            .record_failure(addr, &["redfin".to_owned()], "No agent info found")
            .await
            .unwrap();
        cache
            .record_failure(addr, &["redfin".to_owned(), "zillow".to_owned()], "again")
            .await
            .unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.recorded_failures, 1);

        cache
            .put(addr, &sample_info(), LookupStatus::Found)
            .await
            .unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.cached_results, 1);
        assert_eq!(stats.recorded_failures, 0);
    }

    #[tokio::test]
    async fn pending_excludes_cached_addresses() {
        let (_dir, cache) = scratch_cache(7);
        cache.initialize().await.unwrap();

        cache
            .put("A ST", &sample_info(), LookupStatus::Found)
            .await
            .unwrap();
        let pending = cache
            .pending_addresses(&["A ST".to_owned(), "B ST".to_owned()])
            .await
            .unwrap();
        assert_eq!(pending, vec!["B ST".to_owned()]);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (_dir, cache) = scratch_cache(7);
        cache.initialize().await.unwrap();
        cache.initialize().await.unwrap();
        assert_eq!(cache.stats().await.unwrap().cached_results, 0);
    }
}
