//! Mock provider backend for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Provider, ProviderBackend, ProviderQuery};
use crate::model::RawReference;
use crate::rate_limit::ProviderError;

/// A configurable mock response for [`MockProvider`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Respond 2xx with this JSON body.
    Json(serde_json::Value),
    /// Respond 2xx with these raw bytes.
    Body(Vec<u8>),
    /// Fail the request with this error.
    Fail(ProviderError),
}

type Responder = dyn Fn(&ProviderQuery) -> MockResponse + Send + Sync;

/// A hand-rolled mock implementing [`ProviderBackend`] for tests.
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the last if exhausted), **or**
/// - A responder closure keyed on the query.
/// - Optional per-call latency (honors tokio's paused clock).
/// - Call counting via [`call_count()`](MockProvider::call_count).
///
/// Payloads are decoded with the real parser of the provider being mocked.
pub struct MockProvider {
    provider: Provider,
    responses: Mutex<Vec<MockResponse>>,
    fallback: Option<MockResponse>,
    responder: Option<Box<Responder>>,
    delay: Option<Duration>,
    skip_reason: Option<String>,
    call_count: AtomicUsize,
}

impl MockProvider {
    /// Create a mock that always returns `response`.
    pub fn new(provider: Provider, response: MockResponse) -> Self {
        Self {
            provider,
            responses: Mutex::new(Vec::new()),
            fallback: Some(response),
            responder: None,
            delay: None,
            skip_reason: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Create a mock that returns responses in order, repeating the last one.
    pub fn with_sequence(provider: Provider, mut responses: Vec<MockResponse>) -> Self {
        let fallback = responses.last().cloned();
        // Reverse so we can pop() from the front cheaply.
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            fallback,
            ..Self::new(provider, MockResponse::Fail(ProviderError::NotFound))
        }
    }

    /// Create a mock whose response is computed from the query.
    pub fn with_responder(
        provider: Provider,
        responder: impl Fn(&ProviderQuery) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(provider, MockResponse::Fail(ProviderError::NotFound))
        }
    }

    /// Set simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Skip every reference with this reason instead of building a query.
    pub fn skipping(mut self, reason: &str) -> Self {
        self.skip_reason = Some(reason.to_string());
        self
    }

    /// How many times `fetch()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_response(&self, query: &ProviderQuery) -> MockResponse {
        if let Some(responder) = &self.responder {
            return responder(query);
        }
        let mut seq = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        seq.pop()
            .or_else(|| self.fallback.clone())
            .unwrap_or(MockResponse::Fail(ProviderError::NotFound))
    }
}

impl ProviderBackend for MockProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn build_query(&self, reference: &RawReference) -> Result<ProviderQuery, String> {
        match &self.skip_reason {
            Some(reason) => Err(reason.clone()),
            None => super::default_query(reference),
        }
    }

    fn fetch<'a>(
        &'a self,
        query: &'a ProviderQuery,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let response = self.next_response(query);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Json(value) => Ok(value.to_string().into_bytes()),
                MockResponse::Body(bytes) => Ok(bytes),
                MockResponse::Fail(err) => Err(err),
            }
        })
    }
}
