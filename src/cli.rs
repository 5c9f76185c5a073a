use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "covsync",
    about = "Synchronize the marketplace delivery-coverage cache",
    version
)]
pub struct Cli {
    /// Path to the SQLite cache database
    #[arg(long, global = true, default_value = "~/.covsync/coverage.db")]
    pub db: String,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe candidate postal codes that have no cache verdict yet
    Sync(SyncArgs),
    /// Re-probe keys whose last probe failed permanently
    RetryErrors(RetryErrorsArgs),
    /// Show cache contents and recent sync jobs
    Status(StatusArgs),
    /// Delete the cache database
    ResetCache(ResetCacheArgs),
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    /// Base URL of the coverage API
    #[arg(long, env = "COVERAGE_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the coverage API.
    /// WARNING: passing via --api-key is visible in process listings.
    /// Prefer the COVERAGE_API_KEY environment variable instead.
    #[arg(long, env = "COVERAGE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Country code sent with every probe
    #[arg(long, env = "COVERAGE_COUNTRY_CODE", default_value = "US")]
    pub country_code: String,
}

/// Probe pacing and batching knobs shared by every probing subcommand.
#[derive(Args, Debug)]
pub struct TuningArgs {
    /// Requests/second ceiling for outbound probes (default: conservative preset)
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Use the aggressive rate preset (20 req/s instead of 10)
    #[arg(long)]
    pub aggressive: bool,

    /// Keys per batch
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Concurrent probe workers (clamped to 1-8)
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Retries per key after the initial attempt
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Reference file of candidate postal codes, one 5-digit code per line.
    /// Without it, candidates are synthesized from known US ranges.
    #[arg(long)]
    pub zip_file: Option<String>,

    /// First postal code to include (inclusive)
    #[arg(long)]
    pub start: Option<String>,

    /// Last postal code to include (inclusive)
    #[arg(long)]
    pub end: Option<String>,

    /// Compute and report outstanding work without probing or writing
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub api: ApiArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Args, Debug)]
pub struct RetryErrorsArgs {
    #[command(flatten)]
    pub api: ApiArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Number of recent sync jobs to list
    #[arg(long, default_value_t = 5)]
    pub jobs: u32,
}

#[derive(Args, Debug)]
pub struct ResetCacheArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Default tracing filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
