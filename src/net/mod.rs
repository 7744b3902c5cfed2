//! Networking layer: host classification, per-host rate limiting, and
//! outcome-classified fetching.

pub mod fetcher;
pub mod rate_limiter;

pub use fetcher::{DownloadOutcome, Fetcher};
pub use rate_limiter::RateLimiter;

use std::time::Duration;

use reqwest::Client;

/// Per-request timeout for all remote calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hosts with independently budgeted request policies. Every URL the
/// pipeline touches maps onto exactly one of these budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {
    Reddit,
    Imgur,
    /// Flickr farms, the listing API, and anything else without a dedicated
    /// budget.
    Generic,
}

impl Host {
    /// Classify a URL into a rate-limit budget.
    pub fn of_url(url: &str) -> Host {
        if url.contains("imgur") {
            Host::Imgur
        } else if url.contains("redd.it") || url.contains("reddit.com") {
            Host::Reddit
        } else {
            Host::Generic
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Host::Reddit => "reddit",
            Host::Imgur => "imgur",
            Host::Generic => "generic",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Host::Reddit => 0,
            Host::Imgur => 1,
            Host::Generic => 2,
        }
    }
}

/// Build the shared HTTP client with connection pooling.
pub fn build_client(user_agent: &str) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .gzip(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .tcp_nodelay(true)
        .build()
}
