//! Per-provider rate limiting and retry policy.
//!
//! Every request first waits on its provider's [`ProviderLimiter`]: a
//! minimum spacing gate (driven by the tokio clock) followed by a governor
//! token bucket that caps requests per window while allowing a bounded
//! burst. On 429 the bucket is swapped for a slower one; after a quiet
//! cooldown the original rate is restored.
//!
//! [`RetryPolicy`] wraps a side-effect-free request closure with exponential
//! backoff, honoring `Retry-After` when the server sends one.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;

use crate::CoreError;
use crate::provider::Provider;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Slowdown cap after repeated 429s.
const MAX_SLOWDOWN: u32 = 16;
/// Quiet period after the last 429 before the base rate is restored.
const DECAY_AFTER: Duration = Duration::from_secs(60);

/// Failure of a single provider request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited (429){}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("not found")]
    NotFound,
    #[error("HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed payload: {0}")]
    Parse(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {:.1}s", d.as_secs_f64()))
        .unwrap_or_default()
}

impl ProviderError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }

    /// Transient failures worth another attempt. Timeouts are final: the
    /// request already used its whole budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Network(_) => true,
            ProviderError::Http(status) => *status >= 500,
            ProviderError::Timeout | ProviderError::NotFound | ProviderError::Parse(_) => false,
        }
    }
}

/// Rate settings for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per `window` once the burst is spent.
    pub requests_per_window: u32,
    pub window: Duration,
    /// Requests that may go out back-to-back from a full bucket.
    pub burst: u32,
    /// Minimum gap between two consecutive requests.
    pub min_spacing: Duration,
}

impl RateLimitPolicy {
    pub fn per_second(n: u32) -> Self {
        Self {
            requests_per_window: n.max(1),
            window: Duration::from_secs(1),
            burst: 1,
            min_spacing: Duration::ZERO,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1);
        self
    }

    pub fn with_min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    /// Governor quota at the given slowdown factor.
    fn quota(&self, factor: u32) -> Quota {
        let fallback = Quota::per_second(NonZeroU32::MIN);
        let period = self
            .window
            .checked_div(self.requests_per_window.max(1))
            .and_then(|p| p.checked_mul(factor.max(1)));
        let quota = period.and_then(Quota::with_period).unwrap_or(fallback);
        match NonZeroU32::new(self.burst) {
            Some(burst) => quota.allow_burst(burst),
            None => quota,
        }
    }
}

/// Per-provider limiter with adaptive rate adjustment via ArcSwap.
pub struct ProviderLimiter {
    limiter: ArcSwap<DirectLimiter>,
    policy: RateLimitPolicy,
    /// Earliest tokio instant the next request may start.
    next_slot: Mutex<Option<tokio::time::Instant>>,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    /// Timestamp of the last 429 response.
    last_429: Mutex<Option<Instant>>,
}

impl ProviderLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            limiter: ArcSwap::from(Arc::new(DirectLimiter::direct(policy.quota(1)))),
            policy,
            next_slot: Mutex::new(None),
            current_factor: AtomicU32::new(1),
            last_429: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn slowdown_factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    /// Wait until this provider may send another request.
    pub async fn acquire(&self) {
        self.try_decay();
        self.wait_spacing().await;
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Reserve the next spacing slot and sleep until it arrives.
    async fn wait_spacing(&self) {
        let spacing = self.policy.min_spacing * self.slowdown_factor();
        if spacing.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = tokio::time::Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor and swaps the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_SLOWDOWN))
            });

        let factor = self.slowdown_factor();
        self.limiter
            .store(Arc::new(DirectLimiter::direct(self.policy.quota(factor))));
    }

    /// If the cooldown has passed since the last 429, restore the original rate.
    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed() >= DECAY_AFTER))
            .unwrap_or(false);

        if should_restore && self.slowdown_factor() > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(DirectLimiter::direct(self.policy.quota(1))));
        }
    }
}

/// Collection of per-provider rate limiters.
pub struct RateLimiters {
    limiters: HashMap<Provider, ProviderLimiter>,
    /// Set for the etiquette limiters built by [`RateLimiters::new`]:
    /// whether they assume a contact email. `None` for custom limiters.
    contact_email: Option<bool>,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RateLimiters {
    /// Build limiters with each provider's published etiquette.
    pub fn new(has_contact_email: bool) -> Self {
        let mut limiters = HashMap::new();

        // Crossref: polite pool (with mailto) tolerates more
        let crossref = if has_contact_email {
            RateLimitPolicy::per_second(5).with_burst(5)
        } else {
            RateLimitPolicy::per_second(1).with_burst(2)
        };
        limiters.insert(Provider::Crossref, ProviderLimiter::new(crossref));

        // OpenAlex: 10/s documented ceiling
        limiters.insert(
            Provider::OpenAlex,
            ProviderLimiter::new(RateLimitPolicy::per_second(10).with_burst(5)),
        );

        // Unpaywall: 100k/day; keep requests spaced
        limiters.insert(
            Provider::Unpaywall,
            ProviderLimiter::new(
                RateLimitPolicy::per_second(5).with_min_spacing(Duration::from_millis(100)),
            ),
        );

        Self {
            limiters,
            contact_email: Some(has_contact_email),
        }
    }

    /// True for the etiquette limiters built without a contact email.
    pub fn is_anonymous_etiquette(&self) -> bool {
        self.contact_email == Some(false)
    }

    /// Build limiters from explicit policies, e.g. for tests or tuned deployments.
    pub fn with_policies(policies: impl IntoIterator<Item = (Provider, RateLimitPolicy)>) -> Self {
        Self {
            limiters: policies
                .into_iter()
                .map(|(p, policy)| (p, ProviderLimiter::new(policy)))
                .collect(),
            contact_email: None,
        }
    }

    /// No limiter for any provider.
    pub fn unlimited() -> Self {
        Self {
            limiters: HashMap::new(),
            contact_email: None,
        }
    }

    /// Get the rate limiter for a given provider, if one exists.
    pub fn get(&self, provider: Provider) -> Option<&ProviderLimiter> {
        self.limiters.get(&provider)
    }
}

/// Check if an HTTP response is a 429 and extract Retry-After if present.
///
/// Returns `Err(ProviderError::RateLimited { .. })` if 429, `Ok(())` otherwise.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), ProviderError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(ProviderError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fixed wait rather than trusting clocks
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Make exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Configuration(
                "retry max_attempts must be > 0".into(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(CoreError::Configuration(
                "retry base_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Each attempt first waits on `limiter`. A 429 slows the limiter and
    /// waits for `Retry-After` (capped at `max_delay`) instead of the
    /// computed backoff. `on_retry(attempt, wait)` fires before each sleep.
    pub async fn run<T, F, Fut>(
        &self,
        limiter: Option<&ProviderLimiter>,
        mut op: F,
        mut on_retry: impl FnMut(u32, Duration),
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(lim) = limiter {
                lim.acquire().await;
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let (ProviderError::RateLimited { .. }, Some(lim)) = (&err, limiter) {
                lim.on_rate_limited();
            }
            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let wait = match err {
                ProviderError::RateLimited {
                    retry_after: Some(after),
                } => after.min(self.max_delay),
                _ => self.backoff_for(attempt),
            };
            tracing::debug!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "retrying provider request"
            );
            on_retry(attempt, wait);
            tokio::time::sleep(wait).await;
        }
    }
}
