//! Batch scheduler and resume engine.
//!
//! Drives one synchronization run: diffs the candidate set against keys
//! already cached, partitions the outstanding work into batches, and pushes
//! each key through rate limiting, the prober, retry, and the cache upsert.
//! Per-key failures never abort the run; progress is flushed to the job row
//! at a fixed cadence so an interrupted run loses almost nothing and the next
//! run picks up exactly the keys that never got a verdict.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::probe::{CoverageProber, Outcome};
use crate::ratelimit::RateLimiter;
use crate::retry::{self, RetryAction, RetryConfig};
use crate::store::{CacheEntry, CacheStore, JobCounters, JobStatus, JobType};

/// Subset of application config consumed by the sync engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub job_type: JobType,
    pub batch_size: usize,
    pub workers: usize,
    pub batch_pause: Duration,
    pub flush_every: u64,
    pub retry: RetryConfig,
    pub range: Option<(String, String)>,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

/// Final accounting for one run, printed by the caller.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub status: JobStatus,
    pub candidates_total: u64,
    pub already_cached: u64,
    pub outstanding: u64,
    pub processed: u64,
    pub covered: u64,
    pub not_covered: u64,
    pub errors: u64,
    pub api_calls: u64,
    pub elapsed: Duration,
}

impl SyncReport {
    /// Observed probe rate over the whole run, in requests/second.
    pub fn effective_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.api_calls as f64 / secs
        } else {
            0.0
        }
    }
}

/// Run-wide counters shared by the workers of one run.
#[derive(Debug, Default)]
struct RunCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    api_calls: AtomicU64,
    covered: AtomicU64,
    not_covered: AtomicU64,
}

impl RunCounters {
    fn job_counters(&self) -> JobCounters {
        JobCounters {
            processed: self.processed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            api_calls: self.api_calls.load(Ordering::SeqCst),
        }
    }
}

/// Map a terminal probe outcome to the cache row it should produce.
///
/// Retryable outcomes that survived the backoff policy produce no row at
/// all: the key stays absent from the cache and therefore outstanding for
/// the next run's diff.
fn entry_for_outcome(key: &str, outcome: &Outcome) -> Option<CacheEntry> {
    let now = Utc::now();
    match outcome {
        Outcome::Covered { retailer_count } => Some(CacheEntry {
            zip_code: key.to_string(),
            is_valid: true,
            has_coverage: true,
            retailer_count: Some(*retailer_count),
            last_updated: now,
            last_api_check: now,
            api_response_status: Some(200),
        }),
        Outcome::NotCovered { status } => Some(CacheEntry {
            zip_code: key.to_string(),
            is_valid: true,
            has_coverage: false,
            retailer_count: Some(0),
            last_updated: now,
            last_api_check: now,
            api_response_status: Some(*status),
        }),
        Outcome::PermanentFailure { status, .. } => Some(CacheEntry {
            zip_code: key.to_string(),
            is_valid: false,
            has_coverage: false,
            retailer_count: None,
            last_updated: now,
            last_api_check: now,
            api_response_status: Some(*status),
        }),
        Outcome::RateLimited | Outcome::TransientFailure { .. } => None,
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar`
/// or stdout is not a TTY (e.g. piped output, cron jobs).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

pub struct SyncEngine {
    store: Arc<dyn CacheStore>,
    prober: Arc<dyn CoverageProber>,
    limiter: Arc<RateLimiter>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn CacheStore>,
        prober: Arc<dyn CoverageProber>,
        limiter: Arc<RateLimiter>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            prober,
            limiter,
            options,
        }
    }

    /// Execute one synchronization run over the given candidate set.
    ///
    /// Returns the final report; per-key failures are counted, never
    /// propagated. Only store/configuration failures before processing
    /// starts surface as errors.
    pub async fn run(
        &self,
        candidates: Vec<String>,
        shutdown: CancellationToken,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let candidates_total = candidates.len() as u64;

        // Diffing. Targeted retries re-probe keys that are already cached,
        // so the existence diff only applies to scan jobs.
        let outstanding: Vec<String> = if self.options.job_type == JobType::TargetedRetry {
            candidates
        } else {
            let range = self
                .options
                .range
                .as_ref()
                .map(|(s, e)| (s.as_str(), e.as_str()));
            let existing = self.store.existing_keys(range).await?;
            candidates
                .into_iter()
                .filter(|k| !existing.contains(k))
                .collect()
        };
        let outstanding_total = outstanding.len() as u64;
        let already_cached = candidates_total - outstanding_total;

        tracing::info!(
            candidates = candidates_total,
            cached = already_cached,
            outstanding = outstanding_total,
            "Computed outstanding work"
        );

        let counters = RunCounters::default();

        if self.options.dry_run {
            tracing::info!(
                "[DRY RUN] {} keys would be probed, no writes performed",
                outstanding_total
            );
            return Ok(self.report(
                JobStatus::Completed,
                candidates_total,
                already_cached,
                outstanding_total,
                &counters,
                started.elapsed(),
            ));
        }

        let job_id = self
            .store
            .start_job(self.options.job_type, outstanding_total)
            .await?;

        if outstanding.is_empty() {
            // Re-running against an unchanged cache is a no-op — this is what
            // makes the synchronizer idempotent and resumable.
            self.store
                .finish_job(job_id, JobStatus::Completed, &counters.job_counters())
                .await?;
            tracing::info!("No outstanding keys; cache is complete for this candidate set");
            return Ok(self.report(
                JobStatus::Completed,
                candidates_total,
                already_cached,
                outstanding_total,
                &counters,
                started.elapsed(),
            ));
        }

        let pb = create_progress_bar(self.options.no_progress_bar, outstanding_total);
        let total_batches = outstanding.len().div_ceil(self.options.batch_size);

        for (batch_index, batch) in outstanding.chunks(self.options.batch_size).enumerate() {
            if shutdown.is_cancelled() {
                break;
            }

            // Pause between batches to avoid sustained load spikes on the
            // API and the store.
            if batch_index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.batch_pause) => {}
                    _ = shutdown.cancelled() => break,
                }
            }

            tracing::debug!(
                batch = batch_index + 1,
                total_batches,
                keys = batch.len(),
                "Processing batch"
            );

            let mut results = stream::iter(batch)
                .take_while(|_| std::future::ready(!shutdown.is_cancelled()))
                .map(|key| {
                    let key = key.as_str();
                    pb.set_message(key.to_string());
                    self.process_key(key, &counters, &shutdown)
                })
                .buffer_unordered(self.options.workers.max(1));

            while results.next().await.is_some() {
                pb.inc(1);
                let processed = counters.processed.load(Ordering::SeqCst);
                if processed % self.options.flush_every.max(1) == 0 {
                    self.flush_progress(job_id, &counters).await;
                }
            }
            drop(results);

            self.flush_progress(job_id, &counters).await;
        }

        pb.finish_and_clear();

        let status = if shutdown.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.store
            .finish_job(job_id, status, &counters.job_counters())
            .await?;

        Ok(self.report(
            status,
            candidates_total,
            already_cached,
            outstanding_total,
            &counters,
            started.elapsed(),
        ))
    }

    /// Probe one key and record its verdict.
    ///
    /// Every failure path here increments counters and returns; nothing
    /// escalates past the key.
    async fn process_key(
        &self,
        key: &str,
        counters: &RunCounters,
        shutdown: &CancellationToken,
    ) {
        let outcome = retry::retry_with_backoff(
            &self.options.retry,
            |outcome: &Outcome| {
                // A cancelled run finishes the in-flight attempt but starts
                // no further retries.
                if outcome.is_retryable() && !shutdown.is_cancelled() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || async {
                // Every attempt (retries included) goes through the shared
                // limiter so the global ceiling holds even under retry storms.
                self.limiter.acquire().await;
                counters.api_calls.fetch_add(1, Ordering::SeqCst);
                self.prober.probe(key).await
            },
        )
        .await;

        let mut key_errored = false;
        match &outcome {
            Outcome::Covered { retailer_count } => {
                counters.covered.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(key, retailers = retailer_count, "Key has coverage");
            }
            Outcome::NotCovered { status } => {
                counters.not_covered.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(key, status, "Key has no coverage");
            }
            Outcome::PermanentFailure { .. } => {
                tracing::warn!(key, %outcome, "Recording key as invalid");
                key_errored = true;
            }
            Outcome::RateLimited | Outcome::TransientFailure { .. } => {
                tracing::warn!(key, %outcome, "Retries exhausted; key stays outstanding");
                key_errored = true;
            }
        }

        if let Some(entry) = entry_for_outcome(key, &outcome) {
            if let Err(e) = self.store.upsert(&entry).await {
                tracing::warn!(key, error = %e, "Cache write failed; key will be retried next run");
                key_errored = true;
            }
        }

        if key_errored {
            counters.errors.fetch_add(1, Ordering::SeqCst);
        }
        counters.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Best-effort flush of counters to the job row; a failed flush is only
    /// a logging event, the run continues.
    async fn flush_progress(&self, job_id: i64, counters: &RunCounters) {
        if let Err(e) = self
            .store
            .update_job_progress(job_id, &counters.job_counters())
            .await
        {
            tracing::warn!(error = %e, "Failed to flush job progress");
        }
    }

    #[allow(clippy::too_many_arguments)] // Mirrors the report fields
    fn report(
        &self,
        status: JobStatus,
        candidates_total: u64,
        already_cached: u64,
        outstanding: u64,
        counters: &RunCounters,
        elapsed: Duration,
    ) -> SyncReport {
        SyncReport {
            status,
            candidates_total,
            already_cached,
            outstanding,
            processed: counters.processed.load(Ordering::SeqCst),
            covered: counters.covered.load(Ordering::SeqCst),
            not_covered: counters.not_covered.load(Ordering::SeqCst),
            errors: counters.errors.load(Ordering::SeqCst),
            api_calls: counters.api_calls.load(Ordering::SeqCst),
            elapsed,
        }
    }
}

/// Render a duration as `1h 23m 45s` style text for summaries.
pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};

    use async_trait::async_trait;

    use super::*;
    use crate::store::{SqliteCacheStore, StoreError, SyncJobRecord};

    /// Scripted prober: per-key outcome sequences (the last entry repeats),
    /// with an optional token to cancel after N calls.
    struct StubProber {
        outcomes: std::sync::Mutex<HashMap<String, VecDeque<Outcome>>>,
        default: Outcome,
        calls: AtomicU64,
        cancel_after: Option<(u64, CancellationToken)>,
    }

    impl StubProber {
        fn always(default: Outcome) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(HashMap::new()),
                default,
                calls: AtomicU64::new(0),
                cancel_after: None,
            }
        }

        fn with(mut self, key: &str, sequence: Vec<Outcome>) -> Self {
            self.outcomes
                .get_mut()
                .unwrap()
                .insert(key.to_string(), sequence.into());
            self
        }

        fn cancel_after(mut self, calls: u64, token: CancellationToken) -> Self {
            self.cancel_after = Some((calls, token));
            self
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CoverageProber for StubProber {
        async fn probe(&self, key: &str) -> Outcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if n >= *limit {
                    token.cancel();
                }
            }
            let mut map = self.outcomes.lock().unwrap();
            match map.get_mut(key) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(self.default.clone()),
                None => self.default.clone(),
            }
        }
    }

    /// Store wrapper whose upsert fails for one chosen key.
    struct FlakyStore {
        inner: SqliteCacheStore,
        fail_key: String,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
            if entry.zip_code == self.fail_key {
                return Err(StoreError::Query("simulated write failure".to_string()));
            }
            self.inner.upsert(entry).await
        }

        async fn existing_keys(
            &self,
            range: Option<(&str, &str)>,
        ) -> Result<HashSet<String>, StoreError> {
            self.inner.existing_keys(range).await
        }

        async fn error_keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.error_keys().await
        }

        async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
            self.inner.entry(key).await
        }

        async fn start_job(&self, job_type: JobType, total: u64) -> Result<i64, StoreError> {
            self.inner.start_job(job_type, total).await
        }

        async fn update_job_progress(
            &self,
            id: i64,
            counters: &JobCounters,
        ) -> Result<(), StoreError> {
            self.inner.update_job_progress(id, counters).await
        }

        async fn finish_job(
            &self,
            id: i64,
            status: JobStatus,
            counters: &JobCounters,
        ) -> Result<(), StoreError> {
            self.inner.finish_job(id, status, counters).await
        }

        async fn summary(&self) -> Result<crate::store::CacheSummary, StoreError> {
            self.inner.summary().await
        }

        async fn recent_jobs(&self, limit: u32) -> Result<Vec<SyncJobRecord>, StoreError> {
            self.inner.recent_jobs(limit).await
        }
    }

    fn test_options() -> SyncOptions {
        SyncOptions {
            job_type: JobType::FullScan,
            batch_size: 3,
            workers: 2,
            batch_pause: Duration::ZERO,
            flush_every: 2,
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            range: None,
            dry_run: false,
            no_progress_bar: true,
        }
    }

    fn engine(
        store: Arc<dyn CacheStore>,
        prober: Arc<dyn CoverageProber>,
        options: SyncOptions,
    ) -> SyncEngine {
        SyncEngine::new(store, prober, Arc::new(RateLimiter::new(1_000)), options)
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_mixed_outcomes_scenario() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(
            StubProber::always(Outcome::NotCovered { status: 404 })
                .with("10001", vec![Outcome::Covered { retailer_count: 3 }])
                .with("90210", vec![Outcome::NotCovered { status: 404 }])
                .with(
                    "00000",
                    vec![Outcome::PermanentFailure {
                        status: 403,
                        cause: "unexpected HTTP 403".to_string(),
                    }],
                ),
        );

        let report = engine(store.clone(), prober, test_options())
            .run(keys(&["10001", "90210", "00000"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.processed, 3);
        assert_eq!(report.covered, 1);
        assert_eq!(report.not_covered, 1);
        assert_eq!(report.errors, 1);

        let covered = store.entry("10001").await.unwrap().unwrap();
        assert!(covered.is_valid && covered.has_coverage);
        assert_eq!(covered.retailer_count, Some(3));

        let uncovered = store.entry("90210").await.unwrap().unwrap();
        assert!(uncovered.is_valid && !uncovered.has_coverage);
        assert_eq!(uncovered.retailer_count, Some(0));
        assert_eq!(uncovered.api_response_status, Some(404));

        let invalid = store.entry("00000").await.unwrap().unwrap();
        assert!(!invalid.is_valid);
        assert_eq!(invalid.api_response_status, Some(403));

        let job = &store.recent_jobs(1).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.processed, 3);
        assert_eq!(job.counters.errors, 1);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 1 }));
        let candidate_set = keys(&["10001", "10002", "10003", "10004", "10005"]);

        let first = engine(store.clone(), prober.clone(), test_options())
            .run(candidate_set.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.processed, 5);
        assert_eq!(prober.calls(), 5);

        let second = engine(store.clone(), prober.clone(), test_options())
            .run(candidate_set, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.outstanding, 0);
        assert_eq!(second.processed, 0);
        // No probe was issued on the second run.
        assert_eq!(prober.calls(), 5);

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_entries, 5);
    }

    #[tokio::test]
    async fn test_resume_after_cancellation() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let candidate_set: Vec<String> = (0..10).map(|i| format!("{:05}", 10_000 + i)).collect();

        let token = CancellationToken::new();
        let prober = Arc::new(
            StubProber::always(Outcome::Covered { retailer_count: 1 })
                .cancel_after(4, token.clone()),
        );
        let mut options = test_options();
        options.workers = 1;

        let first = engine(store.clone(), prober, options.clone())
            .run(candidate_set.clone(), token)
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Cancelled);
        assert!(first.processed < 10);

        // The cancelled job is terminal, not stuck in running.
        let job = &store.recent_jobs(1).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
        assert_eq!(job.counters.processed, first.processed);

        // A fresh run's outstanding set is exactly the unprocessed remainder.
        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 1 }));
        let second = engine(store.clone(), prober, options)
            .run(candidate_set, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.outstanding, 10 - first.processed);
        assert_eq!(second.processed, 10 - first.processed);

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_entries, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_covered() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(StubProber::always(Outcome::RateLimited).with(
            "30301",
            vec![
                Outcome::RateLimited,
                Outcome::RateLimited,
                Outcome::Covered { retailer_count: 1 },
            ],
        ));
        let mut options = test_options();
        options.retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
        };

        let start = tokio::time::Instant::now();
        let report = engine(store.clone(), prober.clone(), options)
            .run(keys(&["30301"]), CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        // Backoff slept 2s then 4s (plus <=100ms jitter each) before the
        // third attempt succeeded.
        assert!(elapsed >= Duration::from_millis(6_000), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(6_500), "elapsed {:?}", elapsed);

        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.api_calls, 3);
        assert_eq!(prober.calls(), 3);

        let entry = store.entry("30301").await.unwrap().unwrap();
        assert!(entry.is_valid && entry.has_coverage);
        assert_eq!(entry.retailer_count, Some(1));
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_key_outstanding() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(StubProber::always(Outcome::TransientFailure {
            cause: "connection reset".to_string(),
        }));

        let report = engine(store.clone(), prober.clone(), test_options())
            .run(keys(&["10001"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 1);
        // 1 initial + 2 retries
        assert_eq!(report.api_calls, 3);

        // No verdict was written; the key is still outstanding next run.
        assert!(store.entry("10001").await.unwrap().is_none());
        let second = engine(
            store.clone(),
            Arc::new(StubProber::always(Outcome::Covered { retailer_count: 1 })),
            test_options(),
        )
        .run(keys(&["10001"]), CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(second.outstanding, 1);
    }

    #[tokio::test]
    async fn test_store_write_failure_counts_error_and_continues() {
        let store = Arc::new(FlakyStore {
            inner: SqliteCacheStore::open_in_memory().unwrap(),
            fail_key: "10002".to_string(),
        });
        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 2 }));

        let report = engine(store.clone(), prober, test_options())
            .run(keys(&["10001", "10002", "10003"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.processed, 3);
        assert_eq!(report.errors, 1);

        assert!(store.entry("10001").await.unwrap().is_some());
        assert!(store.entry("10002").await.unwrap().is_none());
        assert!(store.entry("10003").await.unwrap().is_some());

        // The unwritten key still appears outstanding to the next run.
        let existing = store.existing_keys(None).await.unwrap();
        assert!(!existing.contains("10002"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 1 }));
        let mut options = test_options();
        options.dry_run = true;

        let report = engine(store.clone(), prober.clone(), options)
            .run(keys(&["10001", "10002"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outstanding, 2);
        assert_eq!(report.processed, 0);
        assert_eq!(prober.calls(), 0);
        assert_eq!(store.summary().await.unwrap().total_entries, 0);
        assert!(store.recent_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_retry_skips_existence_diff() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        // Seed an invalid entry, as a previous run's permanent failure would.
        store
            .upsert(&entry_for_outcome(
                "00000",
                &Outcome::PermanentFailure {
                    status: 403,
                    cause: "unexpected HTTP 403".to_string(),
                },
            )
            .unwrap())
            .await
            .unwrap();

        let retry_keys = store.error_keys().await.unwrap();
        assert_eq!(retry_keys, vec!["00000".to_string()]);

        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 2 }));
        let mut options = test_options();
        options.job_type = JobType::TargetedRetry;

        let report = engine(store.clone(), prober, options)
            .run(retry_keys, CancellationToken::new())
            .await
            .unwrap();

        // The key was already cached, but a targeted retry probes it anyway.
        assert_eq!(report.outstanding, 1);
        assert_eq!(report.processed, 1);

        let entry = store.entry("00000").await.unwrap().unwrap();
        assert!(entry.is_valid && entry.has_coverage);

        let job = &store.recent_jobs(1).await.unwrap()[0];
        assert_eq!(job.job_type, JobType::TargetedRetry);
    }

    #[tokio::test]
    async fn test_range_limited_diff_only_scans_range() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let prober = Arc::new(StubProber::always(Outcome::Covered { retailer_count: 1 }));
        let mut options = test_options();
        options.job_type = JobType::RangeLimited;
        options.range = Some(("10000".to_string(), "10999".to_string()));

        let report = engine(store.clone(), prober, options)
            .run(keys(&["10001", "10002"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.processed, 2);

        let job = &store.recent_jobs(1).await.unwrap()[0];
        assert_eq!(job.job_type, JobType::RangeLimited);
    }

    #[tokio::test]
    async fn test_progress_flushed_mid_run() {
        let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let token = CancellationToken::new();
        // Cancel partway so the final flush is not the only one observed.
        let prober = Arc::new(
            StubProber::always(Outcome::Covered { retailer_count: 1 })
                .cancel_after(5, token.clone()),
        );
        let mut options = test_options();
        options.workers = 1;
        options.flush_every = 2;

        let candidate_set: Vec<String> = (0..8).map(|i| format!("{:05}", 20_000 + i)).collect();
        let report = engine(store.clone(), prober, options)
            .run(candidate_set, token)
            .await
            .unwrap();

        let job = &store.recent_jobs(1).await.unwrap()[0];
        // Counters persisted at cancellation match the in-memory report.
        assert_eq!(job.counters.processed, report.processed);
        assert_eq!(job.counters.api_calls, report.api_calls);
    }

    #[test]
    fn test_effective_rate() {
        let report = SyncReport {
            status: JobStatus::Completed,
            candidates_total: 10,
            already_cached: 0,
            outstanding: 10,
            processed: 10,
            covered: 5,
            not_covered: 5,
            errors: 0,
            api_calls: 20,
            elapsed: Duration::from_secs(4),
        };
        assert!((report.effective_rate() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_duration_seconds_only() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
    }

    #[test]
    fn test_format_duration_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 00s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m 34s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 00m 00s");
        assert_eq!(format_duration(Duration::from_secs(5025)), "1h 23m 45s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        let pb = create_progress_bar(true, 100);
        assert!(pb.is_hidden());
    }
}
