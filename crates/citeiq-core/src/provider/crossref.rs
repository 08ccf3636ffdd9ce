use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{Provider, ProviderBackend, ProviderQuery, QueryKind, doi_path, http_get, user_agent};
use crate::doi::normalize_doi;
use crate::rate_limit::ProviderError;
use crate::retraction::{RetractionNotice, notice_from_crossref};

pub const DEFAULT_BASE_URL: &str = "https://api.crossref.org";

/// Crossref REST API backend.
pub struct Crossref {
    pub base_url: String,
    pub mailto: Option<String>,
}

impl Crossref {
    pub fn new(mailto: Option<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            mailto,
        }
    }

    fn url_for(&self, query: &ProviderQuery) -> String {
        let mut url = match &query.kind {
            QueryKind::Doi(doi) => format!("{}/works/{}", self.base_url, doi_path(doi)),
            QueryKind::Bibliographic {
                title,
                author,
                year,
            } => {
                let mut terms = title.clone();
                if let Some(author) = author {
                    terms.push(' ');
                    terms.push_str(author);
                }
                if let Some(year) = year {
                    terms.push_str(&format!(" {year}"));
                }
                format!(
                    "{}/works?query.bibliographic={}&rows=3",
                    self.base_url,
                    urlencoding::encode(&terms)
                )
            }
        };
        if let Some(ref email) = self.mailto {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push_str(&format!("{sep}mailto={}", urlencoding::encode(email)));
        }
        url
    }
}

impl ProviderBackend for Crossref {
    fn provider(&self) -> Provider {
        Provider::Crossref
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

/// A Crossref work reduced to the fields the engine reconciles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossrefWork {
    pub doi: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    /// Crossref work type, e.g. `journal-article` or `posted-content`.
    pub work_type: Option<String>,
    pub abstract_text: Option<String>,
    pub citation_count: Option<u64>,
    pub affiliations: Vec<String>,
    pub retraction: Option<RetractionNotice>,
}

// ── Wire format ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireEnvelope<T> {
    message: T,
}

#[derive(Deserialize)]
struct WireSearch {
    #[serde(default)]
    items: Vec<WireWork>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireWork {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    title: Vec<String>,
    author: Vec<WireAuthor>,
    #[serde(rename = "container-title")]
    container_title: Vec<String>,
    #[serde(rename = "type")]
    work_type: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(rename = "is-referenced-by-count")]
    referenced_by_count: Option<u64>,
    issued: Option<WireDate>,
    published: Option<WireDate>,
    #[serde(rename = "update-to")]
    update_to: Vec<WireUpdate>,
    relation: Option<WireRelation>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireAuthor {
    given: Option<String>,
    family: Option<String>,
    name: Option<String>,
    affiliation: Vec<WireAffiliation>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireAffiliation {
    name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireDate {
    #[serde(rename = "date-parts")]
    date_parts: Vec<Vec<Option<i64>>>,
}

impl WireDate {
    fn year(&self) -> Option<i32> {
        self.date_parts
            .first()
            .and_then(|parts| parts.first().copied().flatten())
            .and_then(|y| i32::try_from(y).ok())
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct WireUpdate {
    #[serde(rename = "type")]
    pub(crate) update_type: Option<String>,
    #[serde(rename = "DOI")]
    pub(crate) doi: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct WireRelation {
    #[serde(rename = "is-retracted-by")]
    pub(crate) is_retracted_by: Vec<WireRelated>,
    #[serde(rename = "has-expression-of-concern")]
    pub(crate) has_expression_of_concern: Vec<WireRelated>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct WireRelated {
    pub(crate) id: Option<String>,
}

static JATS_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Crossref abstracts are JATS XML fragments; keep the text only.
fn strip_jats(text: &str) -> String {
    let text = JATS_TAG.replace_all(text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl From<WireWork> for CrossrefWork {
    fn from(w: WireWork) -> Self {
        let authors = w
            .author
            .iter()
            .filter_map(|a| match (&a.given, &a.family, &a.name) {
                (given, Some(family), _) => non_empty(&format!(
                    "{} {}",
                    given.as_deref().unwrap_or(""),
                    family
                )),
                (_, None, Some(name)) => non_empty(name),
                _ => None,
            })
            .collect();

        let mut affiliations: Vec<String> = Vec::new();
        for name in w
            .author
            .iter()
            .flat_map(|a| a.affiliation.iter())
            .filter_map(|aff| aff.name.as_deref().and_then(non_empty))
        {
            if !affiliations.contains(&name) {
                affiliations.push(name);
            }
        }

        let retraction = notice_from_crossref(&w.update_to, w.relation.as_ref());

        CrossrefWork {
            doi: w.doi.as_deref().map(normalize_doi),
            title: w.title.first().and_then(|t| non_empty(t)),
            authors,
            year: w
                .issued
                .as_ref()
                .and_then(WireDate::year)
                .or_else(|| w.published.as_ref().and_then(WireDate::year)),
            venue: w.container_title.first().and_then(|v| non_empty(v)),
            work_type: w.work_type,
            abstract_text: w
                .abstract_text
                .as_deref()
                .map(strip_jats)
                .filter(|a| !a.is_empty()),
            citation_count: w.referenced_by_count,
            affiliations,
            retraction,
        }
    }
}

/// Decode a `/works/{doi}` or `/works?query...` response body.
pub fn parse(query: &ProviderQuery, body: &[u8]) -> Result<Option<CrossrefWork>, ProviderError> {
    match query.kind {
        QueryKind::Doi(_) => {
            let env: WireEnvelope<WireWork> =
                serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(Some(env.message.into()))
        }
        QueryKind::Bibliographic { .. } => {
            let env: WireEnvelope<WireSearch> =
                serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(env.message.items.into_iter().next().map(CrossrefWork::from))
        }
    }
}
