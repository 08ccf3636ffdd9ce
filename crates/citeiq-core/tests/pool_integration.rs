//! Worker pool behavior: result collection, cancellation and the global
//! request bound.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use citeiq_core::cache::ResponseCache;
use citeiq_core::orchestrator::{EnrichmentContext, ProgressFn};
use citeiq_core::pool::enrich_all;
use citeiq_core::provider::ProviderQuery;
use citeiq_core::provider::mock::{MockProvider, MockResponse};
use citeiq_core::{
    AbsentReason, ProgressEvent, Provider, ProviderBackend, ProviderError, ProviderResult,
    RateLimiters, RawReference, RetryPolicy,
};

fn context(providers: Vec<Arc<dyn ProviderBackend>>, max_requests: usize) -> Arc<EnrichmentContext> {
    Arc::new(EnrichmentContext::new(
        providers,
        reqwest::Client::new(),
        Arc::new(ResponseCache::in_memory()),
        Arc::new(RateLimiters::unlimited()),
        RetryPolicy::no_retry(),
        Duration::from_secs(10),
        max_requests,
    ))
}

fn refs(n: usize) -> Vec<RawReference> {
    (0..n)
        .map(|i| RawReference {
            input_index: i,
            title: Some(format!("Reference number {i}")),
            authors: vec!["Ada Lovelace".into()],
            doi: Some(format!("10.1000/ref.{i}")),
            ..Default::default()
        })
        .collect()
}

fn quiet() -> ProgressFn {
    Arc::new(|_| {})
}

fn crossref_found() -> MockResponse {
    MockResponse::Json(serde_json::json!({
        "message": {"DOI": "10.1000/ref", "title": ["Found"], "type": "journal-article"}
    }))
}

#[tokio::test(start_paused = true)]
async fn every_job_is_collected_by_id() {
    let crossref = MockProvider::new(Provider::Crossref, crossref_found())
        .with_delay(Duration::from_millis(50));
    let providers: Vec<Arc<dyn ProviderBackend>> = vec![Arc::new(crossref)];
    let ctx = context(providers, 6);

    let events = Arc::new(AtomicUsize::new(0));
    let counter = events.clone();
    let progress: ProgressFn = Arc::new(move |event| {
        if matches!(event, ProgressEvent::Enriched { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let batch = refs(10);
    let results = enrich_all(&batch, ctx, 3, progress, CancellationToken::new()).await;

    assert_eq!(results.len(), 10);
    assert_eq!(results.keys().copied().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    for r in results.values() {
        assert!(r.crossref().is_some());
        assert_eq!(r.len(), 3);
    }
    assert_eq!(events.load(Ordering::SeqCst), 10);
}

#[tokio::test(start_paused = true)]
async fn progress_events_carry_input_index() {
    let crossref = MockProvider::new(Provider::Crossref, crossref_found());
    let providers: Vec<Arc<dyn ProviderBackend>> = vec![Arc::new(crossref)];
    let ctx = context(providers, 4);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |event| {
        let entry = match event {
            ProgressEvent::Enriching { ref_index, .. } => ("enriching", ref_index),
            ProgressEvent::ProviderComplete { ref_index, .. } => ("provider", ref_index),
            ProgressEvent::Enriched { ref_index, .. } => ("enriched", ref_index),
            _ => return,
        };
        sink.lock().unwrap().push(entry);
    });

    // Input indices that differ from batch positions
    let batch: Vec<_> = refs(3)
        .into_iter()
        .map(|mut r| {
            r.input_index += 100;
            r
        })
        .collect();
    enrich_all(&batch, ctx, 2, progress, CancellationToken::new()).await;

    let seen = seen.lock().unwrap();
    for kind in ["enriching", "provider", "enriched"] {
        let mut indices: Vec<usize> = seen
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, i)| *i)
            .collect();
        indices.sort();
        assert_eq!(indices, vec![100, 101, 102], "{kind} events");
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_is_skipped_not_lost() {
    let crossref = Arc::new(MockProvider::new(Provider::Crossref, crossref_found()));
    let backend: Arc<dyn ProviderBackend> = crossref.clone();
    let ctx = context(vec![backend], 6);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = enrich_all(&refs(5), ctx, 2, quiet(), cancel).await;

    assert_eq!(results.len(), 5);
    assert_eq!(crossref.call_count(), 0);
    for r in results.values() {
        for outcome in r.iter() {
            assert!(matches!(
                &outcome.result,
                ProviderResult::Absent {
                    reason: AbsentReason::Skipped(why),
                    ..
                } if why == "cancelled"
            ));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn failing_provider_does_not_affect_others() {
    let crossref = MockProvider::new(
        Provider::Crossref,
        MockResponse::Fail(ProviderError::Network("connection refused".into())),
    );
    let unpaywall = MockProvider::new(
        Provider::Unpaywall,
        MockResponse::Json(serde_json::json!({"is_oa": false})),
    );
    let providers: Vec<Arc<dyn ProviderBackend>> = vec![Arc::new(crossref), Arc::new(unpaywall)];
    let ctx = context(providers, 6);

    let results = enrich_all(&refs(4), ctx, 4, quiet(), CancellationToken::new()).await;

    for r in results.values() {
        assert!(r.unpaywall().is_some());
        assert!(matches!(
            r.get(Provider::Crossref).unwrap().result,
            ProviderResult::Absent {
                reason: AbsentReason::Error(_),
                ..
            }
        ));
    }
}

/// Tracks how many fetches are in flight at once.
struct Gauge {
    provider: Provider,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ProviderBackend for Gauge {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn fetch<'a>(
        &'a self,
        _query: &'a ProviderQuery,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Err(ProviderError::NotFound)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_requests_respect_global_bound() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let providers: Vec<Arc<dyn ProviderBackend>> = [Provider::Crossref, Provider::OpenAlex, Provider::Unpaywall]
        .into_iter()
        .map(|provider| {
            Arc::new(Gauge {
                provider,
                current: current.clone(),
                peak: peak.clone(),
            }) as Arc<dyn ProviderBackend>
        })
        .collect();
    let ctx = context(providers, 2);

    let results = enrich_all(&refs(8), ctx, 4, quiet(), CancellationToken::new()).await;

    assert_eq!(results.len(), 8);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(current.load(Ordering::SeqCst), 0);
}
