//! End-to-end analysis: enrich → reconcile → deduplicate → score → cluster
//! → report.
//!
//! Only enrichment touches the network. Everything after it is a pure
//! function of the raw references and their provider results.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::ResponseCache;
use crate::cluster::cluster_all;
use crate::dedup::find_duplicates;
use crate::model::{ClusterKind, Flag, RawReference, RefId};
use crate::orchestrator::{EnrichmentContext, ProgressFn};
use crate::pool::enrich_all;
use crate::provider::{self, AbsentReason, ProviderBackend, ProviderResults};
use crate::rate_limit::RateLimiters;
use crate::reconcile::reconcile;
use crate::report::{AggregateStats, AnalysisReport, ReportEntry, sort_entries};
use crate::scoring::score;
use crate::{Config, CoreError, ProgressEvent};

/// A configured analysis engine. Cheap to reuse across batches; the
/// response cache and rate limiters persist between runs.
pub struct Engine {
    config: Config,
    ctx: Arc<EnrichmentContext>,
}

impl Engine {
    /// Build an engine talking to the live providers.
    pub fn new(config: Config) -> Result<Self, CoreError> {
        let providers = provider::build_providers(&config);
        Self::with_providers(config, providers)
    }

    /// Build an engine over an explicit provider list.
    pub fn with_providers(
        mut config: Config,
        providers: Vec<Arc<dyn ProviderBackend>>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        // A contact email admits Crossref's polite pool; custom limiters are kept
        if config.contact_email.is_some() && config.rate_limiters.is_anonymous_etiquette() {
            config.rate_limiters = Arc::new(RateLimiters::new(true));
        }

        let cache = match &config.cache_dir {
            Some(dir) => ResponseCache::open(dir)?,
            None => ResponseCache::in_memory(),
        };
        let client = reqwest::Client::builder()
            .user_agent(provider::user_agent(config.contact_email.as_deref()))
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .build()?;

        let names: Vec<&str> = providers.iter().map(|p| p.provider().name()).collect();
        tracing::info!(providers = ?names, workers = config.num_workers, "engine ready");

        let ctx = EnrichmentContext::from_config(&config, providers, Arc::new(cache), client);
        Ok(Self {
            config,
            ctx: Arc::new(ctx),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.ctx.cache
    }

    /// Analyse one batch.
    ///
    /// Fails only on a malformed batch (repeated input index). Provider
    /// failures and cancellation degrade individual references; every input
    /// reference still appears in the report.
    pub async fn analyze(
        &self,
        refs: Vec<RawReference>,
        progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> Result<AnalysisReport, CoreError> {
        check_unique_indices(&refs)?;
        let progress: ProgressFn = Arc::new(progress);

        tracing::info!(references = refs.len(), "analysis started");
        let results = enrich_all(
            &refs,
            self.ctx.clone(),
            self.config.num_workers,
            progress.clone(),
            cancel,
        )
        .await;

        let report = assemble_report(&refs, &results, &self.config, &progress);
        tracing::info!(
            references = report.stats.total,
            mean_score = report.stats.mean_score,
            duplicate_groups = report.stats.duplicate_groups,
            "analysis complete"
        );
        Ok(report)
    }
}

fn check_unique_indices(refs: &[RawReference]) -> Result<(), CoreError> {
    let mut seen = BTreeSet::new();
    for r in refs {
        if !seen.insert(r.input_index) {
            return Err(CoreError::DuplicateInputIndex(r.input_index));
        }
    }
    Ok(())
}

/// Build the report from raw references and their provider results.
///
/// A reference without results is analysed from its raw fields alone.
pub fn assemble_report(
    refs: &[RawReference],
    results: &BTreeMap<RefId, ProviderResults>,
    config: &Config,
    progress: &ProgressFn,
) -> AnalysisReport {
    let unqueried = ProviderResults::all_absent(AbsentReason::Skipped("not queried".into()));

    progress(ProgressEvent::Stage { name: "reconcile" });
    let enriched: Vec<_> = refs
        .iter()
        .map(|r| {
            let provider_results = results.get(&r.id()).unwrap_or(&unqueried);
            reconcile(r, provider_results, &config.reconcile)
        })
        .collect();

    progress(ProgressEvent::Stage { name: "dedup" });
    let duplicates = find_duplicates(&enriched, &config.dedup);

    progress(ProgressEvent::Stage { name: "score" });
    let duplicate_flag: BTreeSet<Flag> = [Flag::Duplicate].into_iter().collect();
    let no_flags = BTreeSet::new();
    let qualities: Vec<_> = enriched
        .iter()
        .map(|r| {
            let accumulated = if duplicates.is_duplicate(r.id) {
                &duplicate_flag
            } else {
                &no_flags
            };
            score(r, accumulated, duplicates.group_of(r.id), &config.scoring)
        })
        .collect();

    progress(ProgressEvent::Stage { name: "cluster" });
    let clustering = cluster_all(&enriched, &config.clustering);
    let author = clustering.assignment(ClusterKind::Author);
    let organization = clustering.assignment(ClusterKind::Organization);
    let topic = clustering.assignment(ClusterKind::Topic);

    let mut entries: Vec<ReportEntry> = enriched
        .into_iter()
        .zip(qualities)
        .map(|(reference, quality)| {
            let id = reference.id;
            ReportEntry {
                author_cluster: author.get(&id).copied().unwrap_or_default(),
                organization_cluster: organization.get(&id).copied().unwrap_or_default(),
                topic_cluster: topic.get(&id).copied().unwrap_or_default(),
                reference,
                quality,
            }
        })
        .collect();

    let clusters = clustering.into_vec();
    let stats = AggregateStats::compute(&entries, &clusters, duplicates.len(), config.top_entities);
    sort_entries(&mut entries, config.sort_mode);

    AnalysisReport {
        entries,
        clusters,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::crossref::CrossrefWork;
    use crate::provider::{Provider, ProviderResult};
    use crate::report::SortMode;
    use crate::scoring::ScoringConfig;
    use std::sync::Mutex;

    fn raw(index: usize, title: &str, author: &str, doi: Option<&str>) -> RawReference {
        RawReference {
            input_index: index,
            title: Some(title.into()),
            authors: vec![author.into()],
            year: Some(2022),
            doi: doi.map(str::to_string),
            ..Default::default()
        }
    }

    fn config() -> Config {
        Config {
            scoring: ScoringConfig::for_year(2024),
            sort_mode: SortMode::Order,
            ..Config::default()
        }
    }

    fn quiet() -> ProgressFn {
        Arc::new(|_| {})
    }

    #[test]
    fn every_reference_is_reported_without_provider_results() {
        let refs = vec![
            raw(0, "Widgets in Practice", "Ada Lovelace", None),
            raw(1, "Gadgets in Theory", "Grace Hopper", None),
        ];
        let report = assemble_report(&refs, &BTreeMap::new(), &config(), &quiet());
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.stats.total, 2);
        for entry in &report.entries {
            assert!((0.0..=100.0).contains(&entry.quality.score));
            assert!(entry.quality.flags.contains(&Flag::UnresolvedDoi));
        }
    }

    #[test]
    fn shared_doi_marks_later_reference_duplicate() {
        let refs = vec![
            raw(0, "Widgets in Practice", "Ada Lovelace", Some("10.1000/w")),
            raw(1, "Widgets: A Practical Study", "Charles Babbage", Some("10.1000/W")),
        ];
        let found = ProviderResults::all_absent(AbsentReason::NotFound).with(
            ProviderResult::Crossref(CrossrefWork {
                doi: Some("10.1000/w".into()),
                title: Some("Widgets in Practice".into()),
                ..Default::default()
            }),
            true,
        );
        let results: BTreeMap<RefId, ProviderResults> =
            [(0, found.clone()), (1, found)].into_iter().collect();

        let report = assemble_report(&refs, &results, &config(), &quiet());
        let first = report.entry(0).unwrap();
        let second = report.entry(1).unwrap();
        assert!(!first.quality.flags.contains(&Flag::Duplicate));
        assert!(second.quality.flags.contains(&Flag::Duplicate));
        assert_eq!(first.quality.duplicate_group_id, Some(0));
        assert_eq!(second.quality.duplicate_group_id, Some(0));
        assert!(second.quality.score < first.quality.score);
        assert_eq!(report.stats.duplicate_groups, 1);
        assert_eq!(report.stats.flag_count("duplicate"), 1);
    }

    #[test]
    fn stages_are_reported_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::Stage { name } = event {
                sink.lock().unwrap().push(name);
            }
        });
        assemble_report(&[], &BTreeMap::new(), &config(), &progress);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["reconcile", "dedup", "score", "cluster"]
        );
    }

    #[test]
    fn cluster_assignments_match_cluster_membership() {
        let refs = vec![
            raw(0, "Protein folding", "Ada Lovelace", None),
            raw(1, "Protein folding kinetics", "Ada Lovelace", None),
            raw(2, "Galaxy surveys", "Grace Hopper", None),
        ];
        let report = assemble_report(&refs, &BTreeMap::new(), &config(), &quiet());
        for entry in &report.entries {
            for kind in [ClusterKind::Author, ClusterKind::Organization, ClusterKind::Topic] {
                let cluster = report
                    .clusters_of(kind)
                    .find(|c| c.id == entry.cluster(kind))
                    .unwrap();
                assert!(cluster.members.contains(&entry.id()));
            }
        }
        assert_eq!(report.entry(0).unwrap().author_cluster, report.entry(1).unwrap().author_cluster);
        assert_ne!(report.entry(0).unwrap().author_cluster, report.entry(2).unwrap().author_cluster);
    }

    #[test]
    fn duplicate_input_index_is_rejected() {
        let refs = vec![raw(3, "A", "X Y", None), raw(3, "B", "Z W", None)];
        assert!(matches!(
            check_unique_indices(&refs),
            Err(CoreError::DuplicateInputIndex(3))
        ));
    }

    #[test]
    fn contact_email_switches_to_polite_limiters() {
        let config = Config {
            contact_email: Some("me@example.org".into()),
            ..Config::default()
        };
        let engine = Engine::with_providers(config, vec![]).unwrap();
        assert!(!engine.config().rate_limiters.is_anonymous_etiquette());
        let crossref = engine
            .config()
            .rate_limiters
            .get(Provider::Crossref)
            .unwrap()
            .policy();
        assert_eq!(crossref.requests_per_window, 5);

        let custom = Config {
            contact_email: Some("me@example.org".into()),
            rate_limiters: Arc::new(RateLimiters::unlimited()),
            ..Config::default()
        };
        let engine = Engine::with_providers(custom, vec![]).unwrap();
        assert!(engine.config().rate_limiters.get(Provider::Crossref).is_none());
    }

    #[test]
    fn engine_without_providers_builds() {
        let engine = Engine::with_providers(Config::default(), vec![]).unwrap();
        assert!(engine.cache().is_empty());
        assert_eq!(engine.config().num_workers, 4);
    }
}
