//! HTTP fetching of candidate report URLs.
//!
//! Every attempt collapses into one of four outcomes so the engine can
//! tell "wrong URL pattern, keep probing" (NotFound) apart from "right
//! URL, bad moment" (TransientError) and "right URL, broken upload"
//! (InvalidContent). The publisher is known to answer bad paths with
//! styled HTML error pages at HTTP 200, so a 2xx body is only accepted
//! after it looks like an actual PDF.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Outcome of a single fetch attempt against one candidate URL.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// 2xx with a plausible PDF body.
    Fetched {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    /// The candidate URL does not exist; try the next naming pattern.
    NotFound,
    /// Timeout, connection trouble or a 5xx; the same URL may work on retry.
    TransientError { reason: String },
    /// 2xx but the body is not a usable PDF.
    InvalidContent { reason: String },
}

/// Seam between the reconciliation engine and the network. Tests script
/// this; production uses [`HttpFetcher`].
#[async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

/// Limits applied to every fetch.
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub min_pdf_bytes: u64,
    pub max_pdf_bytes: u64,
}

/// Retry budget for transient failures on a single candidate URL.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct HttpFetcher {
    client: Client,
    limits: FetchLimits,
}

impl HttpFetcher {
    pub fn new(limits: FetchLimits) -> Result<Self> {
        let client = Client::builder()
            .timeout(limits.timeout)
            .user_agent(concat!("cf1400-harvester/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, limits })
    }
}

#[async_trait]
impl ReportFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return FetchOutcome::TransientError {
                    reason: format!("timeout after {:?}", self.limits.timeout),
                }
            }
            Err(e) if e.is_connect() => {
                return FetchOutcome::TransientError {
                    reason: format!("connect: {}", e),
                }
            }
            Err(e) => {
                return FetchOutcome::TransientError {
                    reason: e.to_string(),
                }
            }
        };

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => return FetchOutcome::NotFound,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                return FetchOutcome::TransientError {
                    reason: format!("HTTP {}", status),
                }
            }
            s if s.is_server_error() => {
                return FetchOutcome::TransientError {
                    reason: format!("HTTP {}", status),
                }
            }
            s if s.is_client_error() => {
                // CDNs in front of the publisher answer some nonexistent
                // paths with 403 instead of 404.
                debug!(url, %status, "client error treated as absent candidate");
                return FetchOutcome::NotFound;
            }
            s if !s.is_success() => {
                return FetchOutcome::TransientError {
                    reason: format!("HTTP {}", status),
                }
            }
            _ => {}
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if let Some(declared) = response.content_length() {
            if declared > self.limits.max_pdf_bytes {
                return FetchOutcome::InvalidContent {
                    reason: format!(
                        "declared length {} exceeds cap {}",
                        declared, self.limits.max_pdf_bytes
                    ),
                };
            }
        }

        // Stream the body so an unexpectedly huge response is cut off at
        // the cap instead of buffered whole.
        let mut bytes: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    return FetchOutcome::TransientError {
                        reason: format!("body read: {}", e),
                    }
                }
            };
            if (bytes.len() + chunk.len()) as u64 > self.limits.max_pdf_bytes {
                return FetchOutcome::InvalidContent {
                    reason: format!("body exceeds cap {}", self.limits.max_pdf_bytes),
                };
            }
            bytes.extend_from_slice(&chunk);
        }

        validate_pdf(bytes, content_type, &self.limits)
    }
}

/// Accept a 2xx body only if it plausibly is the report PDF.
fn validate_pdf(
    bytes: Vec<u8>,
    content_type: Option<String>,
    limits: &FetchLimits,
) -> FetchOutcome {
    if let Some(ct) = content_type.as_deref() {
        if ct.contains("text/html") {
            return FetchOutcome::InvalidContent {
                reason: "HTML body (publisher error page)".to_string(),
            };
        }
    }
    if (bytes.len() as u64) < limits.min_pdf_bytes {
        return FetchOutcome::InvalidContent {
            reason: format!(
                "{} bytes is below the {} byte minimum",
                bytes.len(),
                limits.min_pdf_bytes
            ),
        };
    }
    if !bytes.starts_with(b"%PDF-") {
        return FetchOutcome::InvalidContent {
            reason: "missing %PDF magic".to_string(),
        };
    }
    FetchOutcome::Fetched {
        bytes,
        content_type,
    }
}

/// Fetch one URL with the retry budget applied to transient failures.
/// NotFound and InvalidContent return immediately; retrying those buys
/// nothing.
pub async fn fetch_with_retry(
    fetcher: &dyn ReportFetcher,
    url: &str,
    policy: &RetryPolicy,
) -> FetchOutcome {
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;
    for attempt in 1..attempts {
        match fetcher.fetch(url).await {
            FetchOutcome::TransientError { reason } => {
                debug!(url, attempt, %reason, "transient fetch failure, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            outcome => return outcome,
        }
    }
    fetcher.fetch(url).await
}
