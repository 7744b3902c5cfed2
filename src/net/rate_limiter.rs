use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{HostPolicies, HostPolicy};

use super::Host;

/// Per-host request pacing. Each host owns an independent clock and backoff
/// window, so saturating one host's budget never delays another's. The
/// policy table is injected at construction and never mutated afterwards;
/// only the per-host state behind each mutex is contended.
///
/// The limiter is advisory: it spaces requests out, but remote failures
/// still surface to the fetcher for retry handling.
pub struct RateLimiter {
    policies: HostPolicies,
    hosts: [Mutex<HostState>; 3],
}

#[derive(Debug, Default)]
struct HostState {
    /// Earliest instant the next request to this host may start.
    next_allowed: Option<Instant>,
    /// Extra delay currently applied on top of the minimum interval,
    /// grown by throttle responses and decayed by successes.
    backoff: Duration,
}

impl RateLimiter {
    pub fn new(policies: HostPolicies) -> Self {
        Self {
            policies,
            hosts: [
                Mutex::new(HostState::default()),
                Mutex::new(HostState::default()),
                Mutex::new(HostState::default()),
            ],
        }
    }

    pub fn policy(&self, host: Host) -> &HostPolicy {
        self.policies.policy(host)
    }

    /// Sleep until a request to `host` is permitted, then claim the slot.
    /// The slot is reserved under the lock; the sleep happens outside it, so
    /// concurrent callers queue up behind each other without contention.
    pub async fn acquire(&self, host: Host) {
        let wait = {
            let policy = self.policies.policy(host);
            let min_interval = Duration::from_millis(policy.min_interval_ms);
            let mut state = self.hosts[host.index()].lock();

            let now = Instant::now();
            let start = match state.next_allowed {
                Some(at) if at > now => at,
                _ => now,
            };
            state.next_allowed = Some(start + min_interval + state.backoff);
            start.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!(host = host.name(), wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a response for `host`. Throttle responses (429) double the
    /// host's backoff up to its configured ceiling; successful responses
    /// decay it back toward zero.
    pub fn on_response(&self, host: Host, status: u16, retry_after: Option<Duration>) {
        let policy = self.policies.policy(host);
        let ceiling = Duration::from_secs(policy.backoff_ceiling_secs);
        let mut state = self.hosts[host.index()].lock();

        if status == 429 {
            let base = Duration::from_millis(policy.min_interval_ms.max(250));
            let grown = if state.backoff.is_zero() { base } else { state.backoff * 2 };
            let grown = retry_after.map_or(grown, |hinted| grown.max(hinted));
            state.backoff = grown.min(ceiling);

            // Push the next slot out past the new backoff window.
            let resume = Instant::now() + state.backoff;
            state.next_allowed = Some(state.next_allowed.map_or(resume, |at| at.max(resume)));

            warn!(
                host = host.name(),
                backoff_ms = state.backoff.as_millis() as u64,
                "throttled, extending backoff"
            );
        } else if status < 400 && !state.backoff.is_zero() {
            let decayed = state.backoff / 2;
            state.backoff = if decayed < Duration::from_millis(50) {
                Duration::ZERO
            } else {
                decayed
            };
            debug!(
                host = host.name(),
                backoff_ms = state.backoff.as_millis() as u64,
                "host responsive again, decaying backoff"
            );
        }
    }

    /// Current throttle-driven backoff for a host.
    pub fn current_backoff(&self, host: Host) -> Duration {
        self.hosts[host.index()].lock().backoff
    }
}
