//! Persistent coverage cache and sync job tracking.
//!
//! This module provides the SQLite-backed cache the rest of the application
//! reads at request time, plus the per-run sync job records. It enables:
//! - Idempotent last-writer-wins upserts per postal code
//! - Resume: paged existence scans to diff candidates against cached keys
//! - Targeted retry of keys whose last probe failed permanently
//! - Operator status reporting over cache contents and past runs

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{CacheStore, SqliteCacheStore};
pub use error::StoreError;
pub use types::{CacheEntry, CacheSummary, JobCounters, JobStatus, JobType, SyncJobRecord};
