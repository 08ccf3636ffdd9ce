use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use super::{Provider, ProviderBackend, ProviderQuery, QueryKind, doi_path, http_get, user_agent};
use crate::doi::{normalize_doi, parse_doi};
use crate::model::RawReference;
use crate::rate_limit::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.unpaywall.org";

/// Unpaywall backend. DOI-only, and the API requires a contact email.
pub struct Unpaywall {
    pub base_url: String,
    pub email: Option<String>,
}

impl Unpaywall {
    pub fn new(email: Option<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            email,
        }
    }

    fn url_for(&self, doi: &str) -> String {
        let email = self.email.as_deref().unwrap_or_default();
        format!(
            "{}/v2/{}?email={}",
            self.base_url,
            doi_path(doi),
            urlencoding::encode(email)
        )
    }
}

impl ProviderBackend for Unpaywall {
    fn provider(&self) -> Provider {
        Provider::Unpaywall
    }

    fn build_query(&self, reference: &RawReference) -> Result<ProviderQuery, String> {
        if self.email.is_none() {
            return Err("no contact email configured".into());
        }
        reference
            .doi
            .as_deref()
            .and_then(parse_doi)
            .map(|doi| ProviderQuery::doi(&doi))
            .ok_or_else(|| "no valid DOI".into())
    }

    fn fetch<'a>(
        &'a self,
        query: &'a ProviderQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let QueryKind::Doi(doi) = &query.kind else {
                return Err(ProviderError::Network(
                    "Unpaywall only supports DOI lookups".into(),
                ));
            };
            let url = self.url_for(doi);
            http_get(client, &url, &user_agent(self.email.as_deref()), timeout).await
        })
    }
}

/// Open-access availability for one DOI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpaywallRecord {
    pub doi: Option<String>,
    pub is_oa: bool,
    pub oa_url: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireRecord {
    doi: Option<String>,
    is_oa: bool,
    best_oa_location: Option<WireLocation>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireLocation {
    url_for_pdf: Option<String>,
    url: Option<String>,
}

/// Decode a `/v2/{doi}` response body.
pub fn parse(body: &[u8]) -> Result<Option<UnpaywallRecord>, ProviderError> {
    let record: WireRecord =
        serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let oa_url = record.best_oa_location.and_then(|loc| {
        loc.url_for_pdf
            .filter(|u| !u.trim().is_empty())
            .or(loc.url.filter(|u| !u.trim().is_empty()))
    });
    Ok(Some(UnpaywallRecord {
        doi: record.doi.as_deref().map(normalize_doi),
        is_oa: record.is_oa,
        oa_url,
    }))
}
