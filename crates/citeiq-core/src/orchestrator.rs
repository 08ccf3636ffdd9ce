//! Per-reference provider fan-out.
//!
//! Every configured provider is queried concurrently for one reference. Each
//! lookup goes cache → rate limiter → retry policy → timed HTTP fetch →
//! parse, and any failure collapses into an `Absent` result for that
//! provider alone. Results accumulate in a local [`ProviderResults`] that the
//! caller receives whole.
//!
//! A reference without a usable DOI gets a second round: once a provider
//! resolves its DOI, the providers that could not key on a DOI in the first
//! round are asked again by that DOI.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::ResponseCache;
use crate::doi::parse_doi;
use crate::model::RawReference;
use crate::provider::{
    AbsentReason, Provider, ProviderBackend, ProviderOutcome, ProviderQuery, ProviderResult,
    ProviderResults,
};
use crate::rate_limit::{ProviderError, RateLimiters, RetryPolicy};
use crate::{Config, ProgressEvent};

/// Progress callback shared between tasks.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Everything a lookup needs, shared by all workers of a run.
pub struct EnrichmentContext {
    pub providers: Vec<Arc<dyn ProviderBackend>>,
    pub client: reqwest::Client,
    pub cache: Arc<ResponseCache>,
    pub rate_limiters: Arc<RateLimiters>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Bounds in-flight HTTP requests across the whole run.
    request_slots: Semaphore,
}

impl EnrichmentContext {
    pub fn new(
        providers: Vec<Arc<dyn ProviderBackend>>,
        client: reqwest::Client,
        cache: Arc<ResponseCache>,
        rate_limiters: Arc<RateLimiters>,
        retry: RetryPolicy,
        timeout: Duration,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            providers,
            client,
            cache,
            rate_limiters,
            retry,
            timeout,
            request_slots: Semaphore::new(max_concurrent_requests.max(1)),
        }
    }

    pub fn from_config(
        config: &Config,
        providers: Vec<Arc<dyn ProviderBackend>>,
        cache: Arc<ResponseCache>,
        client: reqwest::Client,
    ) -> Self {
        Self::new(
            providers,
            client,
            cache,
            config.rate_limiters.clone(),
            config.retry.clone(),
            config.request_timeout(),
            config.max_concurrent_requests,
        )
    }

    fn has_provider(&self, provider: Provider) -> bool {
        self.providers.iter().any(|p| p.provider() == provider)
    }
}

/// Query every provider for one reference.
///
/// The returned results always hold one outcome per known provider;
/// providers that are not configured are `Absent(Skipped)`.
pub async fn enrich_reference(
    ctx: Arc<EnrichmentContext>,
    reference: Arc<RawReference>,
    progress: ProgressFn,
) -> ProviderResults {
    let mut results = ProviderResults::new();
    for outcome in fan_out(&ctx, ctx.providers.clone(), &reference, &progress).await {
        results.insert(outcome);
    }

    let has_raw_doi = reference.doi.as_deref().and_then(parse_doi).is_some();
    if !has_raw_doi && let Some((doi, resolver)) = resolved_doi(&results) {
        let followup: Vec<_> = ctx
            .providers
            .iter()
            .filter(|b| {
                let provider = b.provider();
                provider != resolver && !results.get(provider).is_some_and(|o| o.by_doi)
            })
            .cloned()
            .collect();
        if !followup.is_empty() {
            tracing::debug!(
                ref_index = reference.input_index,
                doi = %doi,
                resolved_by = %resolver,
                providers = followup.len(),
                "querying again by resolved DOI"
            );
            let with_doi = Arc::new(RawReference {
                doi: Some(doi),
                ..(*reference).clone()
            });
            for outcome in fan_out(&ctx, followup, &with_doi, &progress).await {
                let keep_first = results
                    .get(outcome.result.provider())
                    .is_some_and(|first| first.result.is_found() && !outcome.result.is_found());
                if !keep_first {
                    results.insert(outcome);
                }
            }
        }
    }

    for provider in Provider::ALL {
        if results.get(provider).is_none() {
            let reason = if ctx.has_provider(provider) {
                AbsentReason::Error("provider task failed".into())
            } else {
                AbsentReason::Skipped("provider disabled".into())
            };
            results.insert(ProviderOutcome {
                result: ProviderResult::absent(provider, reason),
                by_doi: false,
                cached: false,
            });
        }
    }
    results
}

/// Query `backends` concurrently for one reference.
async fn fan_out(
    ctx: &Arc<EnrichmentContext>,
    backends: Vec<Arc<dyn ProviderBackend>>,
    reference: &Arc<RawReference>,
    progress: &ProgressFn,
) -> Vec<ProviderOutcome> {
    let mut tasks = JoinSet::new();
    for backend in backends {
        tasks.spawn(query_provider(
            ctx.clone(),
            backend,
            reference.clone(),
            progress.clone(),
        ));
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::warn!(
                ref_index = reference.input_index,
                error = %e,
                "provider task failed"
            ),
        }
    }
    outcomes
}

/// The DOI of the first found work that carries a valid one, with the
/// provider that supplied it. Crossref is preferred over OpenAlex.
fn resolved_doi(results: &ProviderResults) -> Option<(String, Provider)> {
    let crossref = results
        .crossref()
        .and_then(|w| w.doi.as_deref())
        .and_then(parse_doi)
        .map(|doi| (doi, Provider::Crossref));
    crossref.or_else(|| {
        results
            .openalex()
            .and_then(|w| w.doi.as_deref())
            .and_then(parse_doi)
            .map(|doi| (doi, Provider::OpenAlex))
    })
}

async fn query_provider(
    ctx: Arc<EnrichmentContext>,
    backend: Arc<dyn ProviderBackend>,
    reference: Arc<RawReference>,
    progress: ProgressFn,
) -> ProviderOutcome {
    let provider = backend.provider();
    let ref_index = reference.input_index;
    let start = tokio::time::Instant::now();

    let outcome = match backend.build_query(&reference) {
        Ok(query) => lookup(&ctx, backend.as_ref(), &query, ref_index, &progress).await,
        Err(reason) => ProviderOutcome {
            result: ProviderResult::absent(provider, AbsentReason::Skipped(reason)),
            by_doi: false,
            cached: false,
        },
    };

    let elapsed = start.elapsed();
    tracing::debug!(
        ref_index,
        provider = %provider,
        status = ?outcome.result.status(),
        cached = outcome.cached,
        elapsed_ms = elapsed.as_millis() as u64,
        "provider lookup complete"
    );
    progress(ProgressEvent::ProviderComplete {
        ref_index,
        provider,
        status: outcome.result.status(),
        elapsed,
        cached: outcome.cached,
    });
    outcome
}

async fn lookup(
    ctx: &EnrichmentContext,
    backend: &dyn ProviderBackend,
    query: &ProviderQuery,
    ref_index: usize,
    progress: &ProgressFn,
) -> ProviderOutcome {
    let provider = backend.provider();
    let by_doi = query.is_doi();
    let outcome = |result: ProviderResult, cached: bool| ProviderOutcome {
        result,
        by_doi,
        cached,
    };

    if let Some(entry) = ctx.cache.get(provider, &query.canonical) {
        match backend.parse(query, &entry.payload) {
            Ok(Some(result)) => return outcome(result, true),
            Ok(None) => {
                return outcome(
                    ProviderResult::absent(provider, AbsentReason::NotFound),
                    true,
                );
            }
            Err(e) => tracing::warn!(
                provider = %provider,
                error = %e,
                "cached payload no longer parses, refetching"
            ),
        }
    }

    let fetched = ctx
        .retry
        .run(
            ctx.rate_limiters.get(provider),
            || async move {
                let _permit = ctx
                    .request_slots
                    .acquire()
                    .await
                    .map_err(|_| ProviderError::Network("request pool closed".into()))?;
                match tokio::time::timeout(
                    ctx.timeout,
                    backend.fetch(query, &ctx.client, ctx.timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout),
                }
            },
            |attempt, backoff| {
                progress(ProgressEvent::RateLimitRetry {
                    ref_index,
                    provider,
                    attempt,
                    backoff,
                })
            },
        )
        .await;

    let result = match fetched {
        Ok(body) => match backend.parse(query, &body) {
            Ok(found) => {
                ctx.cache.insert(provider, &query.canonical, body);
                found.unwrap_or_else(|| ProviderResult::absent(provider, AbsentReason::NotFound))
            }
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "unparseable provider payload");
                ProviderResult::absent(provider, AbsentReason::Error(e.to_string()))
            }
        },
        Err(ProviderError::NotFound) => ProviderResult::absent(provider, AbsentReason::NotFound),
        Err(ProviderError::Timeout) => ProviderResult::absent(provider, AbsentReason::Timeout),
        Err(e) => {
            tracing::debug!(provider = %provider, error = %e, "provider request failed");
            ProviderResult::absent(provider, AbsentReason::Error(e.to_string()))
        }
    };
    outcome(result, false)
}
