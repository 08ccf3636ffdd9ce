//! Metadata provider backends and their typed payloads.
//!
//! A backend is split into three steps so the orchestrator can wrap caching,
//! rate limiting and retries around the one step that touches the network:
//!
//! 1. [`build_query`](ProviderBackend::build_query): pure, derives the
//!    canonical query (and therefore the cache key) from a raw reference.
//! 2. [`fetch`](ProviderBackend::fetch): the side-effecting HTTP request,
//!    returning the raw 2xx body.
//! 3. [`parse`](ProviderBackend::parse): pure, turns a body (fresh or cached)
//!    into a typed [`ProviderResult`].

pub mod crossref;
pub mod mock;
pub mod openalex;
pub mod unpaywall;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authors::get_last_name;
use crate::doi::parse_doi;
use crate::matching::normalize_words;
use crate::model::RawReference;
use crate::rate_limit::{ProviderError, check_rate_limit_response};
use crate::{Config, ProviderStatus};

pub use crossref::CrossrefWork;
pub use openalex::OpenAlexWork;
pub use unpaywall::UnpaywallRecord;

/// The external metadata services the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    Crossref,
    OpenAlex,
    Unpaywall,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Crossref, Provider::OpenAlex, Provider::Unpaywall];

    /// The canonical name, also used in cache envelopes and config files.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Crossref => "Crossref",
            Provider::OpenAlex => "OpenAlex",
            Provider::Unpaywall => "Unpaywall",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a provider is asked about a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Lookup by normalized DOI.
    Doi(String),
    /// Search by normalized title words, first-author surname and year.
    Bibliographic {
        title: String,
        author: Option<String>,
        year: Option<i32>,
    },
}

/// A provider query plus its canonical string form.
///
/// The canonical form is the cache key input, so two references that would
/// send the same request share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderQuery {
    pub kind: QueryKind,
    pub canonical: String,
}

impl ProviderQuery {
    pub fn doi(doi: &str) -> Self {
        let doi = doi.to_lowercase();
        Self {
            canonical: format!("doi:{doi}"),
            kind: QueryKind::Doi(doi),
        }
    }

    pub fn bibliographic(title: &str, author: Option<&str>, year: Option<i32>) -> Self {
        let title = normalize_words(title);
        let author = author.map(get_last_name).filter(|a| !a.is_empty());
        let canonical = format!(
            "bib:{}|{}|{}",
            title,
            author.as_deref().unwrap_or(""),
            year.map(|y| y.to_string()).unwrap_or_default()
        );
        Self {
            kind: QueryKind::Bibliographic {
                title,
                author,
                year,
            },
            canonical,
        }
    }

    pub fn is_doi(&self) -> bool {
        matches!(self.kind, QueryKind::Doi(_))
    }
}

/// DOI lookup when the reference carries a valid DOI, otherwise a
/// bibliographic search when it has a title.
pub fn default_query(reference: &RawReference) -> Result<ProviderQuery, String> {
    if let Some(doi) = reference.doi.as_deref().and_then(parse_doi) {
        return Ok(ProviderQuery::doi(&doi));
    }
    match reference.title.as_deref() {
        Some(title) if !normalize_words(title).is_empty() => Ok(ProviderQuery::bibliographic(
            title,
            reference.first_author(),
            reference.year,
        )),
        _ => Err("no valid DOI or title to search".into()),
    }
}

/// Why a provider has nothing for a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbsentReason {
    Timeout,
    Error(String),
    NotFound,
    /// The provider was not asked (no usable query, disabled, or cancelled).
    Skipped(String),
}

impl fmt::Display for AbsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsentReason::Timeout => f.write_str("timeout"),
            AbsentReason::Error(msg) => write!(f, "error: {msg}"),
            AbsentReason::NotFound => f.write_str("not found"),
            AbsentReason::Skipped(why) => write!(f, "skipped: {why}"),
        }
    }
}

/// Typed outcome of querying one provider for one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult {
    Crossref(CrossrefWork),
    OpenAlex(OpenAlexWork),
    Unpaywall(UnpaywallRecord),
    Absent {
        provider: Provider,
        reason: AbsentReason,
    },
}

impl ProviderResult {
    pub fn absent(provider: Provider, reason: AbsentReason) -> Self {
        ProviderResult::Absent { provider, reason }
    }

    pub fn provider(&self) -> Provider {
        match self {
            ProviderResult::Crossref(_) => Provider::Crossref,
            ProviderResult::OpenAlex(_) => Provider::OpenAlex,
            ProviderResult::Unpaywall(_) => Provider::Unpaywall,
            ProviderResult::Absent { provider, .. } => *provider,
        }
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, ProviderResult::Absent { .. })
    }

    pub fn status(&self) -> ProviderStatus {
        match self {
            ProviderResult::Absent { reason, .. } => match reason {
                AbsentReason::Timeout => ProviderStatus::Timeout,
                AbsentReason::Error(_) => ProviderStatus::Error,
                AbsentReason::NotFound => ProviderStatus::NotFound,
                AbsentReason::Skipped(_) => ProviderStatus::Skipped,
            },
            _ => ProviderStatus::Found,
        }
    }
}

/// One provider's result for a reference, with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutcome {
    pub result: ProviderResult,
    /// The lookup was keyed by DOI rather than a bibliographic search.
    pub by_doi: bool,
    /// Served from the response cache without a network call.
    pub cached: bool,
}

/// All provider outcomes for one reference, keyed by provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResults {
    outcomes: BTreeMap<Provider, ProviderOutcome>,
}

impl ProviderResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every provider absent for the same reason.
    pub fn all_absent(reason: AbsentReason) -> Self {
        let mut results = Self::new();
        for provider in Provider::ALL {
            results.insert(ProviderOutcome {
                result: ProviderResult::absent(provider, reason.clone()),
                by_doi: false,
                cached: false,
            });
        }
        results
    }

    pub fn insert(&mut self, outcome: ProviderOutcome) {
        self.outcomes.insert(outcome.result.provider(), outcome);
    }

    /// Builder-style insert of a fresh (uncached) result.
    pub fn with(mut self, result: ProviderResult, by_doi: bool) -> Self {
        self.insert(ProviderOutcome {
            result,
            by_doi,
            cached: false,
        });
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&ProviderOutcome> {
        self.outcomes.get(&provider)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderOutcome> {
        self.outcomes.values()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn crossref(&self) -> Option<&CrossrefWork> {
        match self.get(Provider::Crossref).map(|o| &o.result) {
            Some(ProviderResult::Crossref(work)) => Some(work),
            _ => None,
        }
    }

    pub fn openalex(&self) -> Option<&OpenAlexWork> {
        match self.get(Provider::OpenAlex).map(|o| &o.result) {
            Some(ProviderResult::OpenAlex(work)) => Some(work),
            _ => None,
        }
    }

    pub fn unpaywall(&self) -> Option<&UnpaywallRecord> {
        match self.get(Provider::Unpaywall).map(|o| &o.result) {
            Some(ProviderResult::Unpaywall(record)) => Some(record),
            _ => None,
        }
    }

    /// True when at least one DOI-keyed lookup ran and every one of them
    /// answered "not found".
    pub fn doi_lookups_not_found(&self) -> bool {
        let mut any = false;
        for outcome in self.outcomes.values().filter(|o| o.by_doi) {
            match &outcome.result {
                ProviderResult::Absent {
                    reason: AbsentReason::NotFound,
                    ..
                } => any = true,
                _ => return false,
            }
        }
        any
    }
}

/// A metadata provider that can be queried for one reference.
pub trait ProviderBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Derive the query for a reference. `Err` carries the reason the
    /// provider should be skipped.
    fn build_query(&self, reference: &RawReference) -> Result<ProviderQuery, String> {
        default_query(reference)
    }

    /// Perform the HTTP request and return the successful body.
    fn fetch<'a>(
        &'a self,
        query: &'a ProviderQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>>;

    /// Decode a body into a typed result; `Ok(None)` means a well-formed
    /// answer with no matching work.
    fn parse(
        &self,
        query: &ProviderQuery,
        body: &[u8],
    ) -> Result<Option<ProviderResult>, ProviderError> {
        parse_payload(self.provider(), query, body)
    }
}

/// Decode a payload with the parser of the given provider.
pub fn parse_payload(
    provider: Provider,
    query: &ProviderQuery,
    body: &[u8],
) -> Result<Option<ProviderResult>, ProviderError> {
    match provider {
        Provider::Crossref => {
            crossref::parse(query, body).map(|w| w.map(ProviderResult::Crossref))
        }
        Provider::OpenAlex => {
            openalex::parse(query, body).map(|w| w.map(ProviderResult::OpenAlex))
        }
        Provider::Unpaywall => {
            unpaywall::parse(body).map(|r| r.map(ProviderResult::Unpaywall))
        }
    }
}

/// Percent-encode a DOI for use as a URL path, keeping its `/` separators.
pub(crate) fn doi_path(doi: &str) -> String {
    doi.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// User-Agent sent to every provider, identifying the contact when known.
pub(crate) fn user_agent(contact_email: Option<&str>) -> String {
    match contact_email {
        Some(email) => format!("CiteIQ/0.1 (mailto:{email})"),
        None => "CiteIQ/0.1".to_string(),
    }
}

/// GET a URL and return the body of a 2xx response.
///
/// 404 maps to [`ProviderError::NotFound`], 429 to
/// [`ProviderError::RateLimited`], any other non-2xx to
/// [`ProviderError::Http`].
pub(crate) async fn http_get(
    client: &reqwest::Client,
    url: &str,
    user_agent: &str,
    timeout: Duration,
) -> Result<Vec<u8>, ProviderError> {
    let resp = client
        .get(url)
        .header("User-Agent", user_agent)
        .timeout(timeout)
        .send()
        .await
        .map_err(ProviderError::from_reqwest)?;

    check_rate_limit_response(&resp)?;

    let status = resp.status();
    if status.as_u16() == 404 {
        return Err(ProviderError::NotFound);
    }
    if !status.is_success() {
        return Err(ProviderError::Http(status.as_u16()));
    }

    resp.bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(ProviderError::from_reqwest)
}

/// Build the live provider list from configuration, skipping disabled ones.
pub fn build_providers(config: &Config) -> Vec<Arc<dyn ProviderBackend>> {
    let email = config.contact_email.clone();
    let mut providers: Vec<Arc<dyn ProviderBackend>> = Vec::new();
    if !config.is_disabled(Provider::Crossref) {
        providers.push(Arc::new(crossref::Crossref::new(email.clone())));
    }
    if !config.is_disabled(Provider::OpenAlex) {
        providers.push(Arc::new(openalex::OpenAlex::new(email.clone())));
    }
    if !config.is_disabled(Provider::Unpaywall) {
        providers.push(Arc::new(unpaywall::Unpaywall::new(email)));
    }
    providers
}
