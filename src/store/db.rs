//! Cache store trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StoreError;
use super::schema;
use super::types::{CacheEntry, CacheSummary, JobCounters, JobStatus, JobType, SyncJobRecord};

/// Rows fetched per page when scanning existing keys, so a full cache of
/// tens of thousands of rows is never loaded in a single statement.
const SCAN_PAGE_SIZE: usize = 1_000;

/// Trait for cache store operations.
///
/// This trait is object-safe and can be used with `Arc<dyn CacheStore>` for
/// shared access across async tasks, and swapped for an in-memory database
/// in engine tests.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert or replace the entry for its key.
    ///
    /// Last writer wins; probes are idempotent and order-independent, so no
    /// versioning is needed. Never errors on a pre-existing or missing key.
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// All keys currently present, optionally restricted to an inclusive
    /// range. Scans page by page until a short page signals end-of-data.
    async fn existing_keys(
        &self,
        range: Option<(&str, &str)>,
    ) -> Result<HashSet<String>, StoreError>;

    /// Keys whose last probe ended in a permanent failure (`is_valid = 0`),
    /// in key order. These feed targeted-retry runs.
    async fn error_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Fetch a single entry by key.
    #[allow(dead_code)] // Engine tests assert on single rows; kept for API completeness
    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Create a sync job row in the `running` state and return its ID.
    async fn start_job(&self, job_type: JobType, total: u64) -> Result<i64, StoreError>;

    /// Flush progress counters to a running job.
    ///
    /// Counters only move forward (`MAX()` in SQL) and only while the job is
    /// still running.
    async fn update_job_progress(&self, id: i64, counters: &JobCounters)
        -> Result<(), StoreError>;

    /// Move a running job to a terminal status with its final counters.
    ///
    /// `completed_at` is written exactly once: the update is guarded on
    /// `status = 'running'`, so finishing an already-finished job is a no-op.
    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        counters: &JobCounters,
    ) -> Result<(), StoreError>;

    /// Get an aggregate summary of the cache.
    async fn summary(&self) -> Result<CacheSummary, StoreError>;

    /// Most recent sync jobs, newest first.
    async fn recent_jobs(&self, limit: u32) -> Result<Vec<SyncJobRecord>, StoreError>;
}

/// SQLite implementation of the cache store.
pub struct SqliteCacheStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCacheStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteCacheStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // Enable WAL mode for better concurrent read/write performance
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO zip_code_cache (zip_code, is_valid, has_coverage, retailer_count, last_updated, last_api_check, api_response_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(zip_code) DO UPDATE SET
                is_valid = excluded.is_valid,
                has_coverage = excluded.has_coverage,
                retailer_count = excluded.retailer_count,
                last_updated = excluded.last_updated,
                last_api_check = excluded.last_api_check,
                api_response_status = excluded.api_response_status
            "#,
            rusqlite::params![
                &entry.zip_code,
                entry.is_valid,
                entry.has_coverage,
                entry.retailer_count,
                entry.last_updated.timestamp(),
                entry.last_api_check.timestamp(),
                entry.api_response_status,
            ],
        )
        .map_err(StoreError::query)?;

        Ok(())
    }

    async fn existing_keys(
        &self,
        range: Option<(&str, &str)>,
    ) -> Result<HashSet<String>, StoreError> {
        let mut keys = HashSet::new();
        let mut offset = 0usize;

        loop {
            let page: Vec<String> = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| StoreError::Query(e.to_string()))?;

                let mut stmt;
                let rows = match range {
                    Some((start, end)) => {
                        stmt = conn
                            .prepare_cached(
                                "SELECT zip_code FROM zip_code_cache WHERE zip_code >= ?1 AND zip_code <= ?2 ORDER BY zip_code LIMIT ?3 OFFSET ?4",
                            )
                            .map_err(StoreError::query)?;
                        stmt.query_map(
                            rusqlite::params![start, end, SCAN_PAGE_SIZE as i64, offset as i64],
                            |row| row.get::<_, String>(0),
                        )
                        .map_err(StoreError::query)?
                        .collect::<Result<Vec<_>, _>>()
                    }
                    None => {
                        stmt = conn
                            .prepare_cached(
                                "SELECT zip_code FROM zip_code_cache ORDER BY zip_code LIMIT ?1 OFFSET ?2",
                            )
                            .map_err(StoreError::query)?;
                        stmt.query_map(
                            rusqlite::params![SCAN_PAGE_SIZE as i64, offset as i64],
                            |row| row.get::<_, String>(0),
                        )
                        .map_err(StoreError::query)?
                        .collect::<Result<Vec<_>, _>>()
                    }
                };
                rows.map_err(StoreError::query)?
            };

            let fetched = page.len();
            keys.extend(page);

            // A short page signals end-of-data.
            if fetched < SCAN_PAGE_SIZE {
                break;
            }
            offset += SCAN_PAGE_SIZE;
        }

        Ok(keys)
    }

    async fn error_keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut stmt = conn
            .prepare_cached("SELECT zip_code FROM zip_code_cache WHERE is_valid = 0 ORDER BY zip_code")
            .map_err(StoreError::query)?;

        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(keys)
    }

    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        conn.query_row(
            "SELECT zip_code, is_valid, has_coverage, retailer_count, last_updated, last_api_check, api_response_status FROM zip_code_cache WHERE zip_code = ?1",
            [key],
            |row| Ok(row_to_cache_entry(row)),
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn start_job(&self, job_type: JobType, total: u64) -> Result<i64, StoreError> {
        let started_at = Utc::now().timestamp();

        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        conn.execute(
            "INSERT INTO sync_jobs (job_type, status, zip_codes_total, started_at) VALUES (?1, 'running', ?2, ?3)",
            rusqlite::params![job_type.as_str(), total as i64, started_at],
        )
        .map_err(StoreError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn update_job_progress(
        &self,
        id: i64,
        counters: &JobCounters,
    ) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        conn.execute(
            r#"
            UPDATE sync_jobs SET
                zip_codes_processed = MAX(zip_codes_processed, ?1),
                errors_encountered = MAX(errors_encountered, ?2),
                api_calls_made = MAX(api_calls_made, ?3)
            WHERE id = ?4 AND status = 'running'
            "#,
            rusqlite::params![
                counters.processed as i64,
                counters.errors as i64,
                counters.api_calls as i64,
                id,
            ],
        )
        .map_err(StoreError::query)?;

        Ok(())
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        counters: &JobCounters,
    ) -> Result<(), StoreError> {
        let completed_at = Utc::now().timestamp();

        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let updated = conn
            .execute(
                r#"
                UPDATE sync_jobs SET
                    status = ?1,
                    completed_at = ?2,
                    zip_codes_processed = MAX(zip_codes_processed, ?3),
                    errors_encountered = MAX(errors_encountered, ?4),
                    api_calls_made = MAX(api_calls_made, ?5)
                WHERE id = ?6 AND status = 'running'
                "#,
                rusqlite::params![
                    status.as_str(),
                    completed_at,
                    counters.processed as i64,
                    counters.errors as i64,
                    counters.api_calls as i64,
                    id,
                ],
            )
            .map_err(StoreError::query)?;

        if updated == 0 {
            tracing::warn!(job_id = id, "finish_job on a job that is not running");
        }

        Ok(())
    }

    async fn summary(&self) -> Result<CacheSummary, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let (total_entries, valid, covered): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(is_valid), 0), COALESCE(SUM(is_valid AND has_coverage), 0) FROM zip_code_cache",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(StoreError::query)?;

        Ok(CacheSummary {
            total_entries: total_entries as u64,
            valid: valid as u64,
            invalid: (total_entries - valid) as u64,
            covered: covered as u64,
            uncovered: (valid - covered) as u64,
        })
    }

    async fn recent_jobs(&self, limit: u32) -> Result<Vec<SyncJobRecord>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT id, job_type, status, zip_codes_total, zip_codes_processed, errors_encountered, api_calls_made, started_at, completed_at FROM sync_jobs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(StoreError::query)?;

        let jobs = stmt
            .query_map([limit as i64], |row| Ok(row_to_job_record(row)))
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(jobs)
    }
}

/// Convert a database row to a CacheEntry.
fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> CacheEntry {
    let zip_code: String = row.get(0).unwrap_or_default();
    let is_valid: bool = row.get(1).unwrap_or(false);
    let has_coverage: bool = row.get(2).unwrap_or(false);
    let retailer_count: Option<u32> = row.get(3).ok();
    let last_updated_ts: i64 = row.get(4).unwrap_or(0);
    let last_api_check_ts: i64 = row.get(5).unwrap_or(0);
    let api_response_status: Option<u16> = row.get(6).ok();

    CacheEntry {
        zip_code,
        is_valid,
        has_coverage,
        retailer_count,
        last_updated: Utc
            .timestamp_opt(last_updated_ts, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        last_api_check: Utc
            .timestamp_opt(last_api_check_ts, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        api_response_status,
    }
}

/// Convert a database row to a SyncJobRecord.
fn row_to_job_record(row: &rusqlite::Row<'_>) -> SyncJobRecord {
    let id: i64 = row.get(0).unwrap_or(0);
    let job_type_str: String = row.get(1).unwrap_or_default();
    let status_str: String = row.get(2).unwrap_or_default();
    let total: i64 = row.get(3).unwrap_or(0);
    let processed: i64 = row.get(4).unwrap_or(0);
    let errors: i64 = row.get(5).unwrap_or(0);
    let api_calls: i64 = row.get(6).unwrap_or(0);
    let started_at_ts: i64 = row.get(7).unwrap_or(0);
    let completed_at_ts: Option<i64> = row.get(8).ok();

    SyncJobRecord {
        id,
        job_type: JobType::from_str(&job_type_str).unwrap_or(JobType::FullScan),
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Running),
        zip_codes_total: total as u64,
        counters: JobCounters {
            processed: processed as u64,
            errors: errors as u64,
            api_calls: api_calls as u64,
        },
        started_at: Utc
            .timestamp_opt(started_at_ts, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        completed_at: completed_at_ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
    }
}
