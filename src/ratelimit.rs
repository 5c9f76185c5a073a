//! Shared outbound request rate limiter.
//!
//! All workers in a run share one limiter; `acquire()` paces requests to a
//! fixed inter-request interval derived from the configured requests/second
//! ceiling. The pacing mutex is held across the sleep, which serializes
//! acquisitions — the global ceiling holds no matter how many workers call
//! concurrently, and no 1-second window can see more than one request per
//! interval.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    last_issue: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter for the given requests/second ceiling (minimum 1).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        let interval_ms = (1_000_f64 / rps as f64).ceil() as u64;
        Self {
            interval: Duration::from_millis(interval_ms),
            last_issue: Mutex::new(None),
        }
    }

    /// Minimum spacing between consecutive requests.
    #[allow(dead_code)] // Exercised by tests; kept for API completeness
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until it is safe to issue the next request.
    pub async fn acquire(&self) {
        let mut last = self.last_issue.lock().await;
        if let Some(prev) = *last {
            let target = prev + self.interval;
            let now = Instant::now();
            if target > now {
                tokio::time::sleep_until(target).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
