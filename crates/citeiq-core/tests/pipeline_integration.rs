//! End-to-end analysis against mock providers (no network).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use citeiq_core::provider::mock::{MockProvider, MockResponse};
use citeiq_core::provider::openalex::OpenAlex;
use citeiq_core::provider::unpaywall::Unpaywall;
use citeiq_core::provider::{ProviderQuery, QueryKind};
use citeiq_core::{
    AnalysisReport, Config, CoreError, Engine, Field, FieldSource, Flag, Provider, ProviderBackend,
    ProviderError, RateLimiters, RawReference, RetryPolicy, ScoringConfig, SortMode,
};

fn test_config() -> Config {
    Config {
        rate_limiters: Arc::new(RateLimiters::unlimited()),
        retry: RetryPolicy::no_retry(),
        scoring: ScoringConfig::for_year(2024),
        sort_mode: SortMode::Order,
        ..Config::default()
    }
}

fn raw(index: usize, title: &str, author: &str, year: i32, doi: &str) -> RawReference {
    RawReference {
        source_file: "paper.pdf".into(),
        input_index: index,
        raw_text: format!("{author}. {title}. {year}. doi:{doi}"),
        title: Some(title.into()),
        authors: vec![author.into()],
        year: Some(year),
        venue: None,
        doi: Some(doi.into()),
        affiliations: vec![],
    }
}

/// Crossref `/works/{doi}` body for a complete record.
fn crossref_work(doi: &str, title: &str, family: &str, year: i32, work_type: &str, venue: &str) -> serde_json::Value {
    json!({
        "status": "ok",
        "message": {
            "DOI": doi,
            "title": [title],
            "author": [{"given": "Pat", "family": family,
                        "affiliation": [{"name": format!("{family} Institute")}]}],
            "container-title": [venue],
            "type": work_type,
            "abstract": format!("<jats:p>An abstract about {title}.</jats:p>"),
            "is-referenced-by-count": 100,
            "issued": {"date-parts": [[year]]}
        }
    })
}

fn crossref_responder(query: &ProviderQuery) -> MockResponse {
    let QueryKind::Doi(doi) = &query.kind else {
        return MockResponse::Fail(ProviderError::NotFound);
    };
    let body = match doi.as_str() {
        "10.1109/example.2023" => crossref_work(
            doi,
            "Robust Widgets for Distributed Systems",
            "Lovelace",
            2023,
            "journal-article",
            "IEEE Transactions on Widgets",
        ),
        "10.1000/retracted.2022" => {
            let mut work = crossref_work(
                doi,
                "Fabricated Results in Gadget Design",
                "Fraud",
                2022,
                "journal-article",
                "Journal of Gadgets",
            );
            work["message"]["update-to"] = json!([{"type": "retraction", "DOI": "10.1000/notice.1"}]);
            work
        }
        "10.48550/arxiv.2301.00001" => crossref_work(
            doi,
            "Scaling Sprockets with Attention",
            "Hopper",
            2023,
            "posted-content",
            "arXiv",
        ),
        d if d.starts_with("10.5555/control.") => crossref_work(
            doi,
            &format!("Control Study Number {}", &d["10.5555/control.".len()..]),
            &format!("Control{}", &d["10.5555/control.".len()..]),
            2023,
            "journal-article",
            "Journal of Controls",
        ),
        _ => return MockResponse::Fail(ProviderError::NotFound),
    };
    MockResponse::Json(body)
}

fn crossref_only_engine() -> Engine {
    let providers: Vec<Arc<dyn ProviderBackend>> = vec![Arc::new(MockProvider::with_responder(
        Provider::Crossref,
        crossref_responder,
    ))];
    Engine::with_providers(test_config(), providers).unwrap()
}

async fn run(engine: &Engine, refs: Vec<RawReference>) -> AnalysisReport {
    engine
        .analyze(refs, |_| {}, CancellationToken::new())
        .await
        .unwrap()
}

fn flags_of(report: &AnalysisReport, id: usize) -> Vec<Flag> {
    report.entry(id).unwrap().quality.flags.iter().copied().collect()
}

#[tokio::test]
async fn four_reference_scenario_flags_and_scores() {
    let engine = crossref_only_engine();
    let refs = vec![
        raw(0, "Robust Widgets for Distributed Systems", "Pat Lovelace", 2023, "10.1109/example.2023"),
        raw(
            1,
            "Robust widgets for distributed systems",
            "P. Lovelace",
            2023,
            "https://doi.org/10.1109/EXAMPLE.2023",
        ),
        raw(2, "Fabricated Results in Gadget Design", "Pat Fraud", 2022, "10.1000/retracted.2022"),
        raw(3, "Scaling Sprockets with Attention", "Pat Hopper", 2023, "10.48550/arXiv.2301.00001"),
    ];
    let report = run(&engine, refs).await;

    assert_eq!(report.entries.len(), 4);
    assert_eq!(flags_of(&report, 0), vec![]);
    assert_eq!(flags_of(&report, 1), vec![Flag::Duplicate]);
    assert_eq!(flags_of(&report, 2), vec![Flag::Retracted]);
    assert_eq!(flags_of(&report, 3), vec![Flag::Preprint]);

    assert_eq!(report.entry(0).unwrap().quality.score, 100.0);
    assert_eq!(report.stats.duplicate_groups, 1);
    assert_eq!(report.stats.retracted, 1);
    assert_eq!(report.stats.preprints, 1);

    let controls: Vec<_> = (0..4)
        .map(|i| {
            raw(
                i,
                &format!("Control Study Number {i}"),
                &format!("Pat Control{i}"),
                2023,
                &format!("10.5555/control.{i}"),
            )
        })
        .collect();
    let control = run(&engine, controls).await;
    assert!(control.entries.iter().all(|e| e.quality.flags.is_empty()));
    assert!(report.stats.mean_score < control.stats.mean_score);
}

#[tokio::test]
async fn crossref_outage_still_scores_every_reference() {
    let openalex = MockProvider::with_responder(Provider::OpenAlex, |query| {
        let QueryKind::Doi(doi) = &query.kind else {
            return MockResponse::Fail(ProviderError::NotFound);
        };
        MockResponse::Json(json!({
            "doi": format!("https://doi.org/{doi}"),
            "title": format!("Open work {}", doi.trim_start_matches("10.7777/open.")),
            "publication_year": 2021,
            "authorships": [{"author": {"display_name": "Sam Open"},
                             "institutions": [{"display_name": "Open University"}]}],
            "primary_location": {"source": {"display_name": "Open Journal", "type": "journal"}},
            "cited_by_count": 4
        }))
    });
    let unpaywall = MockProvider::new(
        Provider::Unpaywall,
        MockResponse::Json(json!({
            "is_oa": true,
            "best_oa_location": {"url_for_pdf": "https://oa.example.org/paper.pdf"}
        })),
    );
    let crossref = MockProvider::new(Provider::Crossref, MockResponse::Fail(ProviderError::Http(503)));
    let providers: Vec<Arc<dyn ProviderBackend>> =
        vec![Arc::new(crossref), Arc::new(openalex), Arc::new(unpaywall)];
    let engine = Engine::with_providers(test_config(), providers).unwrap();

    let refs: Vec<_> = (0..6)
        .map(|i| raw(i, &format!("Open work {i}"), "Sam Open", 2021, &format!("10.7777/open.{i}")))
        .collect();
    let report = run(&engine, refs).await;

    assert_eq!(report.entries.len(), 6);
    for entry in &report.entries {
        assert!((0.0..=100.0).contains(&entry.quality.score));
        assert!(entry.quality.score > 0.0);
        assert!(entry.reference.oa_url.is_some());
        assert_eq!(entry.reference.venue.as_ref().unwrap().value, "Open Journal");
        assert!(!entry.quality.flags.contains(&Flag::UnresolvedDoi));
        assert!(!entry.quality.flags.contains(&Flag::MetadataMismatch));
    }
    assert_eq!(report.stats.open_access, 6);
    assert_eq!(report.stats.total, 6);
}

#[tokio::test]
async fn repeated_input_index_is_fatal() {
    let engine = crossref_only_engine();
    let refs = vec![
        raw(1, "One", "A Person", 2020, "10.1000/one"),
        raw(1, "Two", "B Person", 2020, "10.1000/two"),
    ];
    let err = engine
        .analyze(refs, |_| {}, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateInputIndex(1)));
}

#[tokio::test]
async fn cancelled_run_reports_raw_fields() {
    let engine = crossref_only_engine();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let refs = vec![raw(0, "Robust Widgets for Distributed Systems", "Pat Lovelace", 2023, "10.1109/example.2023")];
    let report = engine.analyze(refs, |_| {}, cancel).await.unwrap();

    let entry = report.entry(0).unwrap();
    assert_eq!(entry.reference.title.as_ref().unwrap().value, "Robust Widgets for Distributed Systems");
    assert!(entry.reference.abstract_text.is_none());
    assert!(entry.quality.flags.contains(&Flag::MissingField(Field::Abstract)));
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let config = Config {
        max_concurrent_requests: 0,
        ..test_config()
    };
    assert!(matches!(
        Engine::with_providers(config, vec![]),
        Err(CoreError::Configuration(_))
    ));
}

/// A real backend's query construction and parsing over a canned network.
struct Canned<B> {
    backend: B,
    answer: fn(&ProviderQuery) -> Result<serde_json::Value, ProviderError>,
    queries: Mutex<Vec<String>>,
}

impl<B> Canned<B> {
    fn new(backend: B, answer: fn(&ProviderQuery) -> Result<serde_json::Value, ProviderError>) -> Self {
        Self {
            backend,
            answer,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl<B: ProviderBackend> ProviderBackend for Canned<B> {
    fn provider(&self) -> Provider {
        self.backend.provider()
    }

    fn build_query(&self, reference: &RawReference) -> Result<ProviderQuery, String> {
        self.backend.build_query(reference)
    }

    fn fetch<'a>(
        &'a self,
        query: &'a ProviderQuery,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ProviderError>> + Send + 'a>> {
        self.queries.lock().unwrap().push(query.canonical.clone());
        let answer = (self.answer)(query).map(|body| serde_json::to_vec(&body).unwrap());
        Box::pin(async move { answer })
    }
}

#[tokio::test]
async fn doi_found_by_search_is_used_for_open_access_lookup() {
    let crossref = MockProvider::with_responder(Provider::Crossref, |query| match &query.kind {
        QueryKind::Bibliographic { .. } => {
            let work = crossref_work(
                "10.1000/found",
                "Robust Widgets for Distributed Systems",
                "Lovelace",
                2023,
                "journal-article",
                "IEEE Transactions on Widgets",
            );
            MockResponse::Json(json!({"message": {"items": [work["message"]]}}))
        }
        QueryKind::Doi(_) => MockResponse::Fail(ProviderError::NotFound),
    });
    let openalex = Arc::new(Canned::new(OpenAlex::new(None), |query| match &query.kind {
        QueryKind::Doi(doi) => Ok(json!({
            "doi": format!("https://doi.org/{doi}"),
            "title": "Robust Widgets for Distributed Systems",
            "publication_year": 2023,
            "cited_by_count": 12
        })),
        QueryKind::Bibliographic { .. } => Ok(json!({"results": []})),
    }));
    let unpaywall = Arc::new(Canned::new(
        Unpaywall::new(Some("me@example.org".into())),
        |query| match &query.kind {
            QueryKind::Doi(doi) => Ok(json!({
                "doi": doi,
                "is_oa": true,
                "best_oa_location": {"url_for_pdf": "https://oa.example.org/found.pdf"}
            })),
            QueryKind::Bibliographic { .. } => Err(ProviderError::NotFound),
        },
    ));
    let providers: Vec<Arc<dyn ProviderBackend>> = vec![
        Arc::new(crossref),
        openalex.clone(),
        unpaywall.clone(),
    ];
    let engine = Engine::with_providers(test_config(), providers).unwrap();

    let mut reference = raw(0, "Robust Widgets for Distributed Systems", "Pat Lovelace", 2023, "");
    reference.doi = None;
    let report = run(&engine, vec![reference]).await;
    let entry = report.entry(0).unwrap();

    let doi = entry.reference.doi.as_ref().unwrap();
    assert_eq!(doi.value, "10.1000/found");
    assert_eq!(doi.source, FieldSource::Crossref);
    let oa_url = entry.reference.oa_url.as_ref().unwrap();
    assert_eq!(oa_url.value, "https://oa.example.org/found.pdf");
    assert_eq!(oa_url.source, FieldSource::Unpaywall);
    assert_eq!(entry.reference.citation_count.as_ref().unwrap().value, 12);
    assert!(!entry.quality.flags.contains(&Flag::UnresolvedDoi));

    assert_eq!(unpaywall.queries(), vec!["doi:10.1000/found"]);
    let openalex_queries = openalex.queries();
    assert_eq!(openalex_queries.len(), 2);
    assert!(openalex_queries[0].starts_with("bib:"));
    assert_eq!(openalex_queries[1], "doi:10.1000/found");
    assert_eq!(report.stats.open_access, 1);
}
