//! Coverage prober — issues one coverage query per postal code against the
//! marketplace API and classifies the raw HTTP result into a structured
//! outcome.
//!
//! Classification is deliberately payload-inspecting: an HTTP 200 whose
//! retailer list is empty is NOT coverage. Earlier cache-population tooling
//! treated any 200 as covered and polluted the cache with false positives.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// Structured result of probing one postal code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// HTTP 200 with a non-empty retailer list.
    Covered { retailer_count: u32 },
    /// HTTP 404, or HTTP 200 with an empty retailer list. The raw status is
    /// kept for the cache's diagnostics column.
    NotCovered { status: u16 },
    /// HTTP 429. Retried under backoff, never a terminal verdict.
    RateLimited,
    /// Network timeout, connection failure, or HTTP 5xx. Retryable.
    TransientFailure { cause: String },
    /// Any other non-2xx/404 status. Not retried; the key is recorded as
    /// invalid.
    PermanentFailure { status: u16, cause: String },
}

impl Outcome {
    /// Whether this outcome is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientFailure { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Covered { retailer_count } => {
                write!(f, "covered ({} retailers)", retailer_count)
            }
            Self::NotCovered { status } => write!(f, "not covered (HTTP {})", status),
            Self::RateLimited => write!(f, "rate limited"),
            Self::TransientFailure { cause } => write!(f, "transient failure: {}", cause),
            Self::PermanentFailure { status, cause } => {
                write!(f, "permanent failure (HTTP {}): {}", status, cause)
            }
        }
    }
}

/// Classify a probe response by status code and, for 2xx responses, the
/// number of retailers in the parsed body.
pub fn classify(status: u16, retailer_count: Option<usize>) -> Outcome {
    match (status, retailer_count) {
        (200..=299, Some(n)) if n > 0 => Outcome::Covered {
            retailer_count: n as u32,
        },
        (200..=299, _) => Outcome::NotCovered { status },
        (404, _) => Outcome::NotCovered { status },
        (429, _) => Outcome::RateLimited,
        (500..=599, _) => Outcome::TransientFailure {
            cause: format!("server error (HTTP {})", status),
        },
        (s, _) => Outcome::PermanentFailure {
            status: s,
            cause: format!("unexpected HTTP {}", s),
        },
    }
}

/// Response body of the retailers endpoint. Retailer records are opaque
/// here — only their count matters for the coverage verdict.
#[derive(Debug, Deserialize)]
struct RetailersResponse {
    #[serde(default)]
    retailers: Vec<serde_json::Value>,
}

/// Trait for issuing coverage probes.
///
/// Object-safe so the sync engine can be driven by stub probers in tests.
#[async_trait]
pub trait CoverageProber: Send + Sync {
    async fn probe(&self, key: &str) -> Outcome;
}

/// Prober backed by the live marketplace API.
pub struct HttpProber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    country_code: String,
}

impl HttpProber {
    /// Build a prober with a bounded per-request timeout.
    pub fn new(
        base_url: &str,
        api_key: &str,
        country_code: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            country_code: country_code.to_string(),
        })
    }
}

impl fmt::Debug for HttpProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProber")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("country_code", &self.country_code)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CoverageProber for HttpProber {
    async fn probe(&self, key: &str) -> Outcome {
        let url = format!(
            "{}/retailers?postal_code={}&country_code={}",
            self.base_url, key, self.country_code
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Outcome::TransientFailure {
                    cause: format!("request timed out: {}", e),
                };
            }
            Err(e) if e.is_connect() => {
                return Outcome::TransientFailure {
                    cause: format!("connection failed: {}", e),
                };
            }
            Err(e) => {
                return Outcome::TransientFailure {
                    cause: format!("request failed: {}", e),
                };
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            // A truncated or malformed 200 body is indistinguishable from a
            // dropped connection — treat it as transient, not as a verdict.
            match response.json::<RetailersResponse>().await {
                Ok(body) => classify(status, Some(body.retailers.len())),
                Err(e) => Outcome::TransientFailure {
                    cause: format!("body decode failed: {}", e),
                },
            }
        } else {
            classify(status, None)
        }
    }
}
