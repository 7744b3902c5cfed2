use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{Host, RateLimiter};

/// Result of one fetch attempt against a remote host. Non-success variants
/// drive the keep/drop decision for the record that requested the fetch.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Success {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    /// Gone from the host; retrying cannot help.
    NotFound,
    RateLimited {
        retry_after: Option<Duration>,
    },
    /// Connection failures, timeouts, 5xx responses.
    Transient,
    /// 4xx other than 404/429, or a malformed response.
    Permanent {
        reason: String,
    },
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DownloadOutcome::Success { .. } => "success",
            DownloadOutcome::NotFound => "not found",
            DownloadOutcome::RateLimited { .. } => "rate limited",
            DownloadOutcome::Transient => "transient error",
            DownloadOutcome::Permanent { .. } => "permanent error",
        }
    }
}

/// HTTP fetcher. Pure network I/O: it never touches the filesystem or the
/// annotation store. Every request passes through the rate limiter before
/// it is issued and reports its status back afterwards.
pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    retry_base: Duration,
}

impl Fetcher {
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            retry_base: Duration::from_millis(1_000),
        }
    }

    /// Override the base delay between retry attempts.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch `url` under `host`'s budget. Transient failures and throttle
    /// responses are retried with exponential backoff up to the host's
    /// retry bound; NotFound and permanent failures return immediately.
    pub async fn fetch(&self, url: &str, host: Host) -> DownloadOutcome {
        self.fetch_with_auth(url, host, None).await
    }

    /// Same as [`fetch`](Self::fetch), with an `Authorization` header value
    /// (e.g. `Bearer ...` or `Client-ID ...`).
    pub async fn fetch_with_auth(
        &self,
        url: &str,
        host: Host,
        authorization: Option<&str>,
    ) -> DownloadOutcome {
        let max_attempts = self.limiter.policy(host).max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if attempts > 1 {
                debug!(url, attempt = attempts, max_attempts, "retrying fetch");
            }

            self.limiter.acquire(host).await;
            let outcome = self.fetch_once(url, host, authorization).await;

            match &outcome {
                DownloadOutcome::Transient if attempts < max_attempts => {
                    let backoff = calculate_backoff(attempts, self.retry_base.as_millis() as u64);
                    debug!(url, backoff_ms = backoff, "transient failure, backing off");
                    sleep(Duration::from_millis(backoff)).await;
                }
                DownloadOutcome::RateLimited { retry_after } if attempts < max_attempts => {
                    let wait = retry_after.unwrap_or_else(|| {
                        Duration::from_millis(calculate_backoff(
                            attempts,
                            self.retry_base.as_millis() as u64,
                        ))
                    });
                    warn!(url, wait_ms = wait.as_millis() as u64, "rate limited, backing off");
                    sleep(wait).await;
                }
                _ => return outcome,
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        host: Host,
        authorization: Option<&str>,
    ) -> DownloadOutcome {
        let mut request = self.client.get(url);
        if let Some(value) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "request failed");
                return DownloadOutcome::Transient;
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        self.limiter.on_response(host, status.as_u16(), retry_after);

        if status.is_success() {
            // Imgur serves a 200 "removed.png" placeholder for deleted
            // images; treat it as gone.
            if host == Host::Imgur && response.url().as_str().contains("removed.png") {
                return DownloadOutcome::NotFound;
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string);

            return match response.bytes().await {
                Ok(bytes) => DownloadOutcome::Success {
                    bytes: bytes.to_vec(),
                    content_type,
                },
                Err(e) => {
                    warn!(url, error = %e, "failed to read response body");
                    DownloadOutcome::Transient
                }
            };
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => DownloadOutcome::NotFound,
            StatusCode::TOO_MANY_REQUESTS => DownloadOutcome::RateLimited { retry_after },
            s if s.is_server_error() => DownloadOutcome::Transient,
            s => DownloadOutcome::Permanent {
                reason: format!("HTTP {s}"),
            },
        }
    }
}

/// Exponential backoff: 2^(attempt-1) * base, capped at 60 seconds.
fn calculate_backoff(attempt: usize, base_delay_ms: u64) -> u64 {
    let exponent = (attempt as u32).saturating_sub(1).min(16);
    let max_delay = 60_000;

    let delay = (1u64 << exponent) * base_delay_ms;
    std::cmp::min(delay, max_delay)
}
