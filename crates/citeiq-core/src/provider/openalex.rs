use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use super::{Provider, ProviderBackend, ProviderQuery, QueryKind, doi_path, http_get, user_agent};
use crate::doi::normalize_doi;
use crate::rate_limit::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.openalex.org";

/// Concepts scored below this are too weak to tag a work with.
const MIN_CONCEPT_SCORE: f64 = 0.3;
const MAX_CONCEPTS: usize = 5;

/// OpenAlex works API backend.
pub struct OpenAlex {
    pub base_url: String,
    /// Sent as `mailto` to get into the polite pool.
    pub mailto: Option<String>,
}

impl OpenAlex {
    pub fn new(mailto: Option<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            mailto,
        }
    }

    fn url_for(&self, query: &ProviderQuery) -> String {
        let mut url = match &query.kind {
            QueryKind::Doi(doi) => format!("{}/works/doi:{}", self.base_url, doi_path(doi)),
            QueryKind::Bibliographic { title, .. } => format!(
                "{}/works?search={}&per-page=3",
                self.base_url,
                urlencoding::encode(title)
            ),
        };
        if let Some(ref email) = self.mailto {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push_str(&format!("{sep}mailto={}", urlencoding::encode(email)));
        }
        url
    }
}

impl ProviderBackend for OpenAlex {
    fn provider(&self) -> Provider {
        Provider::OpenAlex
    }

    fn fetch<'a>(
        &'a self,
        query: &'a ProviderQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url_for(query);
            http_get(client, &url, &user_agent(self.mailto.as_deref()), timeout).await
        })
    }
}

/// An OpenAlex work reduced to the fields the engine reconciles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenAlexWork {
    pub doi: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    /// Source type of the primary location, e.g. `journal` or `repository`.
    pub source_type: Option<String>,
    /// Work type, e.g. `article` or `preprint`.
    pub work_type: Option<String>,
    pub is_retracted: bool,
    pub abstract_text: Option<String>,
    pub citation_count: Option<u64>,
    pub institutions: Vec<String>,
    pub concepts: Vec<String>,
}

// ── Wire format ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireSearch {
    #[serde(default)]
    results: Vec<WireWork>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireWork {
    doi: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
    publication_year: Option<i32>,
    authorships: Vec<WireAuthorship>,
    primary_location: Option<WireLocation>,
    host_venue: Option<WireHostVenue>,
    is_retracted: bool,
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
    cited_by_count: Option<u64>,
    concepts: Vec<WireConcept>,
    #[serde(rename = "type")]
    work_type: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireAuthorship {
    author: Option<WireNamed>,
    institutions: Vec<WireNamed>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireNamed {
    display_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireLocation {
    source: Option<WireSource>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireSource {
    display_name: Option<String>,
    #[serde(rename = "type")]
    source_type: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireHostVenue {
    display_name: Option<String>,
    #[serde(rename = "type")]
    venue_type: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireConcept {
    display_name: String,
    score: f64,
}

/// Rebuild abstract text from OpenAlex's `word -> [positions]` index.
pub fn rebuild_abstract(index: &HashMap<String, Vec<usize>>) -> Option<String> {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |&p| (p, word.as_str())))
        .collect();
    if positioned.is_empty() {
        return None;
    }
    positioned.sort_unstable();
    let words: Vec<&str> = positioned.into_iter().map(|(_, w)| w).collect();
    Some(words.join(" "))
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl From<WireWork> for OpenAlexWork {
    fn from(w: WireWork) -> Self {
        let authors = w
            .authorships
            .iter()
            .filter_map(|a| non_empty(a.author.as_ref().and_then(|n| n.display_name.as_deref())))
            .collect();

        let mut institutions: Vec<String> = Vec::new();
        for name in w
            .authorships
            .iter()
            .flat_map(|a| a.institutions.iter())
            .filter_map(|i| non_empty(i.display_name.as_deref()))
        {
            if !institutions.contains(&name) {
                institutions.push(name);
            }
        }

        let primary_source = w.primary_location.as_ref().and_then(|l| l.source.as_ref());
        let venue = non_empty(primary_source.and_then(|s| s.display_name.as_deref())).or_else(
            || non_empty(w.host_venue.as_ref().and_then(|h| h.display_name.as_deref())),
        );
        let source_type = primary_source
            .and_then(|s| s.source_type.clone())
            .or_else(|| w.host_venue.as_ref().and_then(|h| h.venue_type.clone()));

        let concepts = w
            .concepts
            .iter()
            .filter(|c| c.score >= MIN_CONCEPT_SCORE && !c.display_name.trim().is_empty())
            .take(MAX_CONCEPTS)
            .map(|c| c.display_name.trim().to_string())
            .collect();

        OpenAlexWork {
            doi: w.doi.as_deref().map(normalize_doi),
            title: non_empty(w.title.as_deref()).or_else(|| non_empty(w.display_name.as_deref())),
            authors,
            year: w.publication_year,
            venue,
            source_type,
            work_type: w.work_type,
            is_retracted: w.is_retracted,
            abstract_text: w.abstract_inverted_index.as_ref().and_then(rebuild_abstract),
            citation_count: w.cited_by_count,
            institutions,
            concepts,
        }
    }
}

/// Decode a `/works/doi:{doi}` or `/works?search=...` response body.
pub fn parse(query: &ProviderQuery, body: &[u8]) -> Result<Option<OpenAlexWork>, ProviderError> {
    match query.kind {
        QueryKind::Doi(_) => {
            let work: WireWork =
                serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(Some(work.into()))
        }
        QueryKind::Bibliographic { .. } => {
            let search: WireSearch =
                serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(search.results.into_iter().next().map(OpenAlexWork::from))
        }
    }
}
