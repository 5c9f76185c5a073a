//! Run configuration, built once at process start and injected into each
//! component. Nothing in this crate reads credentials or endpoints from
//! global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::candidates::is_valid_key;
use crate::cli::{ApiArgs, TuningArgs};
use crate::retry::RetryConfig;

/// Rate presets, in requests/second. The conservative preset is the default;
/// `--aggressive` opts into the higher ceiling.
pub const CONSERVATIVE_RATE_LIMIT: u32 = 10;
pub const AGGRESSIVE_RATE_LIMIT: u32 = 20;

/// Bounded per-probe request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Pause between batches, so sustained load on the API and the store stays
/// spiky-free.
const BATCH_PAUSE: Duration = Duration::from_millis(1_000);

/// Flush progress counters to the job row at least every this many keys.
const PROGRESS_FLUSH_EVERY: u64 = 25;

/// Worker-count ceiling.
const MAX_WORKERS: usize = 8;

/// Application configuration for a probing run.
pub struct Config {
    pub api_base_url: String,
    pub api_key: String,
    pub country_code: String,
    pub db_path: PathBuf,
    pub rate_limit_rps: u32,
    pub batch_size: usize,
    pub workers: usize,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub batch_pause: Duration,
    pub flush_every: u64,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &"<redacted>")
            .field("country_code", &self.country_code)
            .field("db_path", &self.db_path)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("batch_size", &self.batch_size)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Build and validate run configuration from CLI/environment inputs.
    ///
    /// Missing credentials are a fatal configuration error, caught here
    /// before any work begins.
    pub fn new(db: &str, api: ApiArgs, tuning: TuningArgs) -> anyhow::Result<Self> {
        let api_base_url = api.api_url.filter(|s| !s.is_empty()).ok_or_else(|| {
            anyhow::anyhow!("Coverage API URL is not configured (set COVERAGE_API_URL or pass --api-url)")
        })?;
        let api_key = api.api_key.filter(|s| !s.is_empty()).ok_or_else(|| {
            anyhow::anyhow!("Coverage API key is not configured (set COVERAGE_API_KEY or pass --api-key)")
        })?;

        let rate_limit_rps = match tuning.rate_limit {
            Some(0) => anyhow::bail!("--rate-limit must be at least 1"),
            Some(rps) => rps,
            None if tuning.aggressive => AGGRESSIVE_RATE_LIMIT,
            None => CONSERVATIVE_RATE_LIMIT,
        };

        if tuning.batch_size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }

        Ok(Self {
            api_base_url,
            api_key,
            country_code: api.country_code,
            db_path: expand_tilde(db),
            rate_limit_rps,
            batch_size: tuning.batch_size,
            workers: tuning.workers.clamp(1, MAX_WORKERS),
            retry: RetryConfig {
                max_retries: tuning.max_retries,
                ..RetryConfig::default()
            },
            request_timeout: REQUEST_TIMEOUT,
            batch_pause: BATCH_PAUSE,
            flush_every: PROGRESS_FLUSH_EVERY,
            no_progress_bar: tuning.no_progress_bar,
        })
    }
}

/// Validate an optional inclusive key range from `--start`/`--end`.
pub fn parse_range(
    start: Option<String>,
    end: Option<String>,
) -> anyhow::Result<Option<(String, String)>> {
    match (start, end) {
        (None, None) => Ok(None),
        (start, end) => {
            let start = start.unwrap_or_else(|| "00000".to_string());
            let end = end.unwrap_or_else(|| "99999".to_string());
            for key in [&start, &end] {
                if !is_valid_key(key) {
                    anyhow::bail!("'{}' is not a 5-digit postal code", key);
                }
            }
            if start > end {
                anyhow::bail!("--start {} is after --end {}", start, end);
            }
            Ok(Some((start, end)))
        }
    }
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
