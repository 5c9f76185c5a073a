//! covsync — offline synchronizer for the marketplace delivery-coverage cache.
//!
//! Enumerates every plausible postal code, probes a rate-limited external
//! retailers API for coverage, and persists the verdicts in a local SQLite
//! cache so the application never probes inline with user traffic. Runs are
//! resumable: only keys without a cached verdict are probed, so an
//! interrupted multi-hour run picks up where it left off.

#![warn(clippy::all)]

mod candidates;
mod cli;
mod config;
mod probe;
mod ratelimit;
pub mod retry;
mod shutdown;
mod store;
mod sync;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::Config;
use store::{CacheStore, JobType, SqliteCacheStore};
use sync::{SyncEngine, SyncOptions, SyncReport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let Cli {
        db,
        log_level,
        command,
    } = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter())),
        )
        .init();

    match command {
        Command::Sync(args) => run_sync(&db, args).await,
        Command::RetryErrors(args) => run_retry_errors(&db, args).await,
        Command::Status(args) => run_status(&db, args).await,
        Command::ResetCache(args) => run_reset_cache(&db, args).await,
    }
}

/// Open (creating if needed) the cache database for a probing run.
async fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteCacheStore>> {
    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = SqliteCacheStore::open(&config.db_path).await?;
    tracing::debug!("Cache database opened at {}", config.db_path.display());
    Ok(Arc::new(store))
}

/// Assemble the engine from run configuration and execute it.
async fn run_engine(
    config: &Config,
    store: Arc<dyn CacheStore>,
    options: SyncOptions,
    candidate_keys: Vec<String>,
) -> anyhow::Result<SyncReport> {
    let prober = Arc::new(probe::HttpProber::new(
        &config.api_base_url,
        &config.api_key,
        &config.country_code,
        config.request_timeout,
    )?);
    let limiter = Arc::new(ratelimit::RateLimiter::new(config.rate_limit_rps));
    let shutdown_token = shutdown::install_signal_handler();

    let engine = SyncEngine::new(store, prober, limiter, options);
    engine.run(candidate_keys, shutdown_token).await
}

fn engine_options(config: &Config, job_type: JobType, dry_run: bool) -> SyncOptions {
    SyncOptions {
        job_type,
        batch_size: config.batch_size,
        workers: config.workers,
        batch_pause: config.batch_pause,
        flush_every: config.flush_every,
        retry: config.retry,
        range: None,
        dry_run,
        no_progress_bar: config.no_progress_bar,
    }
}

/// Run the sync command: full scan or range-limited run.
async fn run_sync(db: &str, args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = Config::new(db, args.api, args.tuning)?;
    let range = config::parse_range(args.start, args.end)?;

    let source = match &args.zip_file {
        Some(path) => candidates::CandidateSource::ReferenceFile(config::expand_tilde(path)),
        None => candidates::CandidateSource::SynthesizedRanges,
    };
    let mut candidate_keys = candidates::generate(&source)?;
    if let Some((start, end)) = &range {
        candidate_keys =
            candidates::restrict_range(candidate_keys, Some(start.as_str()), Some(end.as_str()));
        if candidate_keys.is_empty() {
            anyhow::bail!("No candidate keys fall within {}..={}", start, end);
        }
    }

    let job_type = if range.is_some() {
        JobType::RangeLimited
    } else {
        JobType::FullScan
    };

    tracing::info!(
        rate_limit = config.rate_limit_rps,
        batch_size = config.batch_size,
        workers = config.workers,
        candidates = candidate_keys.len(),
        "Starting coverage sync"
    );

    let store = open_store(&config).await?;
    let mut options = engine_options(&config, job_type, args.dry_run);
    options.range = range;

    let report = run_engine(&config, store, options, candidate_keys).await?;
    print_report(&report);
    Ok(())
}

/// Run the retry-errors command: targeted re-probe of keys whose last probe
/// failed permanently.
async fn run_retry_errors(db: &str, args: cli::RetryErrorsArgs) -> anyhow::Result<()> {
    let config = Config::new(db, args.api, args.tuning)?;
    let store = open_store(&config).await?;

    let retry_keys = store.error_keys().await?;
    if retry_keys.is_empty() {
        println!("No error entries to retry.");
        return Ok(());
    }
    tracing::info!(count = retry_keys.len(), "Retrying keys with error verdicts");

    let options = engine_options(&config, JobType::TargetedRetry, false);
    let report = run_engine(&config, store, options, retry_keys).await?;
    print_report(&report);
    Ok(())
}

/// Print the end-of-run summary. Per-key errors are reported here, not via
/// the exit code; only configuration failures exit non-zero.
fn print_report(report: &SyncReport) {
    println!();
    println!("── Sync Summary ──");
    println!("  Status:         {}", report.status.as_str());
    println!("  Candidates:     {}", report.candidates_total);
    println!("  Already cached: {}", report.already_cached);
    println!("  Outstanding:    {}", report.outstanding);
    println!("  Processed:      {}", report.processed);
    println!("  Covered:        {}", report.covered);
    println!("  Not covered:    {}", report.not_covered);
    println!("  Errors:         {}", report.errors);
    println!("  API calls:      {}", report.api_calls);
    println!("  Elapsed:        {}", sync::format_duration(report.elapsed));
    println!("  Effective rate: {:.1} req/s", report.effective_rate());
}

/// Run the status command.
async fn run_status(db: &str, args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = config::expand_tilde(db);

    if !db_path.exists() {
        println!("No cache database found at {}", db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let store = SqliteCacheStore::open(&db_path).await?;
    let summary = store.summary().await?;

    println!("Coverage cache: {}", db_path.display());
    println!();
    println!("Entries:");
    println!("  Total:       {}", summary.total_entries);
    println!("  Valid:       {}", summary.valid);
    println!("  Covered:     {}", summary.covered);
    println!("  Not covered: {}", summary.uncovered);
    println!("  Invalid:     {}", summary.invalid);

    let jobs = store.recent_jobs(args.jobs).await?;
    if !jobs.is_empty() {
        println!();
        println!("Recent sync jobs:");
        for job in jobs {
            let completed = job
                .completed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  #{} {} [{}] {}/{} processed, {} errors, {} API calls",
                job.id,
                job.job_type.as_str(),
                job.status.as_str(),
                job.counters.processed,
                job.zip_codes_total,
                job.counters.errors,
                job.counters.api_calls,
            );
            println!(
                "      started {}, completed {}",
                job.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                completed,
            );
        }
    }

    Ok(())
}

/// Run the reset-cache command.
async fn run_reset_cache(db: &str, args: cli::ResetCacheArgs) -> anyhow::Result<()> {
    let db_path = config::expand_tilde(db);

    if !db_path.exists() {
        println!("No cache database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the cache database at:");
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)?;
    println!("Cache database deleted.");

    // Also remove WAL and SHM files if they exist
    let wal_path = db_path.with_extension("db-wal");
    let shm_path = db_path.with_extension("db-shm");
    let _ = std::fs::remove_file(&wal_path);
    let _ = std::fs::remove_file(&shm_path);

    Ok(())
}
