//! Types for the cache store module.

use chrono::{DateTime, Utc};

/// One row of the coverage cache, keyed by postal code.
///
/// This is the single source of truth the rest of the application reads at
/// request time; rows are only ever written by offline sync runs, never
/// inline with user traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Five-digit postal code, the primary key.
    pub zip_code: String,
    /// Whether the key is a recognized, queryable postal code at all
    /// (distinct from whether the marketplace serves it).
    pub is_valid: bool,
    /// Whether at least one retailer currently serves this key.
    pub has_coverage: bool,
    /// Number of retailers serving the key, when known.
    pub retailer_count: Option<u32>,
    /// When this row was last written.
    pub last_updated: DateTime<Utc>,
    /// When the key was last probed against the live API. Diverges from
    /// `last_updated` if a value is later corrected without a new probe.
    pub last_api_check: DateTime<Utc>,
    /// Raw HTTP status of the last probe, kept for diagnostics.
    pub api_response_status: Option<u16>,
}

/// Kind of synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    /// Probe every candidate key not yet cached.
    FullScan,
    /// Re-probe keys previously recorded as errors.
    TargetedRetry,
    /// Full scan restricted to a start/end key range.
    RangeLimited,
}

impl JobType {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullScan => "full_scan",
            Self::TargetedRetry => "targeted_retry",
            Self::RangeLimited => "range_limited",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full_scan" => Some(Self::FullScan),
            "targeted_retry" => Some(Self::TargetedRetry),
            "range_limited" => Some(Self::RangeLimited),
            _ => None,
        }
    }
}

/// Terminal or in-flight status of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Job is in progress. A job must never be left in this state by a
    /// finished process; resume logic treats it as live.
    Running,
    /// Job drained its outstanding set.
    Completed,
    /// Job aborted on a fatal error.
    Failed,
    /// Job was stopped by an operator signal; counters are preserved.
    Cancelled,
}

impl JobStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Progress counters flushed to a sync job row.
///
/// Counters are monotonically non-decreasing while a job is running; the
/// store enforces this with `MAX()` on update so a stale flush can never
/// move progress backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    /// Keys whose probe sequence ran to completion (success or failure).
    pub processed: u64,
    /// Keys that ended in an error (exhausted retries, permanent failure,
    /// or a store write failure).
    pub errors: u64,
    /// Individual HTTP probe attempts issued, retries included.
    pub api_calls: u64,
}

/// One persisted sync job row, as read back for operator inspection.
#[derive(Debug, Clone)]
pub struct SyncJobRecord {
    pub id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub zip_codes_total: u64,
    pub counters: JobCounters,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate view of the cache, for the status command.
#[derive(Debug, Clone)]
pub struct CacheSummary {
    /// Total rows in the cache.
    pub total_entries: u64,
    /// Rows with `is_valid = true`.
    pub valid: u64,
    /// Rows with `is_valid = false` (probe ended in a permanent failure).
    pub invalid: u64,
    /// Valid rows with coverage.
    pub covered: u64,
    /// Valid rows without coverage.
    pub uncovered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trip() {
        for job_type in [
            JobType::FullScan,
            JobType::TargetedRetry,
            JobType::RangeLimited,
        ] {
            assert_eq!(JobType::from_str(job_type.as_str()), Some(job_type));
        }
    }

    #[test]
    fn test_job_type_from_invalid() {
        assert_eq!(JobType::from_str("invalid"), None);
    }

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_job_status_from_invalid() {
        assert_eq!(JobStatus::from_str("invalid"), None);
    }

    #[test]
    fn test_job_counters_default() {
        let counters = JobCounters::default();
        assert_eq!(counters.processed, 0);
        assert_eq!(counters.errors, 0);
        assert_eq!(counters.api_calls, 0);
    }
}
