use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod authors;
pub mod cache;
pub mod cluster;
pub mod config_file;
pub mod dedup;
pub mod doi;
pub mod matching;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod reconcile;
pub mod report;
pub mod retraction;
pub mod scoring;
pub mod union_find;

// Re-export for convenience
pub use cache::{CacheEntry, ResponseCache, cache_key};
pub use cluster::{ClusterConfig, TopicConfig};
pub use dedup::{DedupConfig, DuplicateGroups, find_duplicates};
pub use model::{
    Cluster, ClusterKind, EnrichedReference, Field, FieldSource, Flag, QualityReport,
    RawReference, RefId, Sourced, VenueKind,
};
pub use pipeline::Engine;
pub use provider::{AbsentReason, Provider, ProviderBackend, ProviderResult, ProviderResults};
pub use rate_limit::{ProviderError, RateLimiters, RetryPolicy};
pub use reconcile::{ReconcileConfig, reconcile};
pub use report::{AggregateStats, AnalysisReport, ReportEntry, SortMode};
pub use scoring::{ScoringConfig, score};

/// Fatal errors. Everything that goes wrong per reference or per provider is
/// absorbed into flags or `Absent` results instead; only bad configuration
/// and malformed input batches stop an analysis run.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("duplicate input index {0} in reference batch")]
    DuplicateInputIndex(usize),
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },
    #[error("config file error: {0}")]
    ConfigFile(String),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of one provider lookup, as reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Found,
    NotFound,
    Timeout,
    Error,
    Skipped,
}

/// Progress events emitted during an analysis run.
///
/// `ref_index` is always the reference's `input_index`, so events for one
/// reference can be correlated across kinds.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Enriching {
        ref_index: usize,
        total: usize,
        title: String,
    },
    ProviderComplete {
        ref_index: usize,
        provider: Provider,
        status: ProviderStatus,
        elapsed: Duration,
        cached: bool,
    },
    RateLimitRetry {
        ref_index: usize,
        provider: Provider,
        attempt: u32,
        backoff: Duration,
    },
    Enriched {
        ref_index: usize,
        total: usize,
    },
    /// A post-enrichment stage (reconcile, dedup, scoring, clustering) started.
    Stage {
        name: &'static str,
    },
}

/// Configuration for the analysis engine.
#[derive(Clone)]
pub struct Config {
    /// Contact address sent as the Crossref `mailto` courtesy parameter and
    /// required by Unpaywall.
    pub contact_email: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub sort_mode: SortMode,
    pub num_workers: usize,
    /// Upper bound on in-flight provider requests across the whole pool.
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub disabled_providers: Vec<String>,
    pub rate_limiters: Arc<RateLimiters>,
    pub retry: RetryPolicy,
    pub reconcile: ReconcileConfig,
    pub dedup: DedupConfig,
    pub scoring: ScoringConfig,
    pub clustering: ClusterConfig,
    /// How many authors/organizations to list in the aggregate statistics.
    pub top_entities: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("contact_email", &self.contact_email.as_ref().map(|_| "***"))
            .field("cache_dir", &self.cache_dir)
            .field("output_dir", &self.output_dir)
            .field("sort_mode", &self.sort_mode)
            .field("num_workers", &self.num_workers)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("disabled_providers", &self.disabled_providers)
            .field("retry", &self.retry)
            .field("reconcile", &self.reconcile)
            .field("dedup", &self.dedup)
            .field("scoring", &self.scoring)
            .field("clustering", &self.clustering)
            .field("top_entities", &self.top_entities)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contact_email: None,
            cache_dir: None,
            output_dir: None,
            sort_mode: SortMode::Author,
            num_workers: 4,
            max_concurrent_requests: 6,
            request_timeout_secs: 15,
            disabled_providers: vec![],
            rate_limiters: Arc::new(RateLimiters::default()),
            retry: RetryPolicy::default(),
            reconcile: ReconcileConfig::default(),
            dedup: DedupConfig::default(),
            scoring: ScoringConfig::default(),
            clustering: ClusterConfig::default(),
            top_entities: 10,
        }
    }
}

impl Config {
    /// Reject tuning values that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.num_workers == 0 {
            return Err(CoreError::Configuration("num_workers must be > 0".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(CoreError::Configuration(
                "max_concurrent_requests must be > 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Configuration(
                "request_timeout_secs must be > 0".into(),
            ));
        }
        if let Some(email) = &self.contact_email
            && !email.contains('@')
        {
            return Err(CoreError::Configuration(format!(
                "contact email {email:?} is not an address"
            )));
        }
        if let Some(dir) = &self.output_dir
            && dir.exists()
            && !dir.is_dir()
        {
            return Err(CoreError::InvalidPath {
                path: dir.clone(),
                reason: "output path exists and is not a directory".into(),
            });
        }
        self.retry.validate()?;
        self.reconcile.validate()?;
        self.dedup.validate()?;
        self.scoring.validate()?;
        self.clustering.validate()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_disabled(&self, provider: Provider) -> bool {
        self.disabled_providers
            .iter()
            .any(|d| d.eq_ignore_ascii_case(provider.name()))
    }
}

/// Enrich, reconcile, deduplicate, score and cluster a batch of references
/// against the live providers.
///
/// Progress events are emitted via the callback. Cancelling the token stops
/// provider traffic; references not yet enriched are still analysed from
/// their raw fields.
pub async fn analyze(
    refs: Vec<RawReference>,
    config: Config,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<AnalysisReport, CoreError> {
    let engine = Engine::new(config)?;
    engine.analyze(refs, progress, cancel).await
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn debug_masks_contact_email() {
        let config = Config {
            contact_email: Some("someone@example.org".into()),
            ..Config::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("someone@example.org"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = Config {
            num_workers: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::Configuration(_))
        ));
    }

    #[test]
    fn output_path_that_is_a_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config {
            output_dir: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn disabled_provider_match_is_case_insensitive() {
        let config = Config {
            disabled_providers: vec!["openalex".into()],
            ..Config::default()
        };
        assert!(config.is_disabled(Provider::OpenAlex));
        assert!(!config.is_disabled(Provider::Crossref));
    }
}
