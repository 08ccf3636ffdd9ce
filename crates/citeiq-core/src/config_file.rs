use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimiters;
use crate::report::SortMode;
use crate::{Config, CoreError};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub contact: Option<ContactConfig>,
    pub paths: Option<PathsConfig>,
    pub providers: Option<ProvidersConfig>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub analysis: Option<AnalysisConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactConfig {
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub cache_dir: Option<String>,
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub disabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub num_workers: Option<usize>,
    pub max_concurrent_requests: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub max_retry_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// `author`, `year` or `order`.
    pub sort_mode: Option<String>,
    pub topic_clusters: Option<usize>,
    pub topic_seed: Option<u64>,
    pub top_entities: Option<usize>,
    pub title_similarity_threshold: Option<f64>,
    pub jaccard_threshold: Option<f64>,
    /// Pin the currency reference year instead of using the current year.
    pub reference_year: Option<i32>,
}

/// Platform config directory path: `<config_dir>/citeiq/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("citeiq").join("config.toml"))
}

/// Load config by cascading CWD `.citeiq.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".citeiq.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bc, oc) = (
        base.contact.unwrap_or_default(),
        overlay.contact.unwrap_or_default(),
    );
    let (bp, op) = (
        base.paths.unwrap_or_default(),
        overlay.paths.unwrap_or_default(),
    );
    let (bv, ov) = (
        base.providers.unwrap_or_default(),
        overlay.providers.unwrap_or_default(),
    );
    let (bn, on) = (
        base.concurrency.unwrap_or_default(),
        overlay.concurrency.unwrap_or_default(),
    );
    let (ba, oa) = (
        base.analysis.unwrap_or_default(),
        overlay.analysis.unwrap_or_default(),
    );

    ConfigFile {
        contact: Some(ContactConfig {
            email: oc.email.or(bc.email),
        }),
        paths: Some(PathsConfig {
            cache_dir: op.cache_dir.or(bp.cache_dir),
            output_dir: op.output_dir.or(bp.output_dir),
        }),
        providers: Some(ProvidersConfig {
            disabled: ov.disabled.or(bv.disabled),
        }),
        concurrency: Some(ConcurrencyConfig {
            num_workers: on.num_workers.or(bn.num_workers),
            max_concurrent_requests: on.max_concurrent_requests.or(bn.max_concurrent_requests),
            request_timeout_secs: on.request_timeout_secs.or(bn.request_timeout_secs),
            max_retry_attempts: on.max_retry_attempts.or(bn.max_retry_attempts),
        }),
        analysis: Some(AnalysisConfig {
            sort_mode: oa.sort_mode.or(ba.sort_mode),
            topic_clusters: oa.topic_clusters.or(ba.topic_clusters),
            topic_seed: oa.topic_seed.or(ba.topic_seed),
            top_entities: oa.top_entities.or(ba.top_entities),
            title_similarity_threshold: oa
                .title_similarity_threshold
                .or(ba.title_similarity_threshold),
            jaccard_threshold: oa.jaccard_threshold.or(ba.jaccard_threshold),
            reference_year: oa.reference_year.or(ba.reference_year),
        }),
    }
}

/// Save the config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, CoreError> {
    let path = config_path()
        .ok_or_else(|| CoreError::ConfigFile("could not determine config directory".into()))?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            CoreError::ConfigFile(format!("failed to create config directory: {e}"))
        })?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| CoreError::ConfigFile(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, content)
        .map_err(|e| CoreError::ConfigFile(format!("failed to write config: {e}")))
}

/// Overlay the values present in `file` onto `config`.
///
/// Only an unknown sort mode fails here; range checks happen in
/// [`Config::validate`].
pub fn apply_to(file: &ConfigFile, config: &mut Config) -> Result<(), CoreError> {
    if let Some(email) = file.contact.as_ref().and_then(|c| c.email.clone()) {
        config.contact_email = Some(email);
        // Crossref's polite pool allows a higher rate with a contact address
        config.rate_limiters = Arc::new(RateLimiters::new(true));
    }

    if let Some(paths) = &file.paths {
        if let Some(dir) = &paths.cache_dir {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = &paths.output_dir {
            config.output_dir = Some(PathBuf::from(dir));
        }
    }

    if let Some(disabled) = file.providers.as_ref().and_then(|p| p.disabled.clone()) {
        config.disabled_providers = disabled;
    }

    if let Some(c) = &file.concurrency {
        if let Some(n) = c.num_workers {
            config.num_workers = n;
        }
        if let Some(n) = c.max_concurrent_requests {
            config.max_concurrent_requests = n;
        }
        if let Some(secs) = c.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        if let Some(attempts) = c.max_retry_attempts {
            config.retry.max_attempts = attempts;
        }
    }

    if let Some(a) = &file.analysis {
        if let Some(mode) = &a.sort_mode {
            config.sort_mode = mode.parse::<SortMode>()?;
        }
        if let Some(k) = a.topic_clusters {
            config.clustering.topic.k = k;
        }
        if let Some(seed) = a.topic_seed {
            config.clustering.topic.seed = seed;
        }
        if let Some(n) = a.top_entities {
            config.top_entities = n;
        }
        if let Some(t) = a.title_similarity_threshold {
            config.reconcile.title_similarity_threshold = t;
        }
        if let Some(t) = a.jaccard_threshold {
            config.dedup.jaccard_threshold = t;
        }
        if let Some(year) = a.reference_year {
            config.scoring.reference_year = year;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_round_trip() {
        let config = ConfigFile {
            paths: Some(PathsConfig {
                cache_dir: Some("/tmp/citeiq-cache".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn absent_fields_deserialize_as_none() {
        let toml_str = "[analysis]\nsort_mode = \"year\"\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let analysis = parsed.analysis.unwrap();
        assert_eq!(analysis.sort_mode.as_deref(), Some("year"));
        assert!(analysis.topic_clusters.is_none());
        assert!(parsed.paths.is_none());
    }

    #[test]
    fn merge_overlay_wins_and_base_fills_gaps() {
        let base = ConfigFile {
            contact: Some(ContactConfig {
                email: Some("base@example.org".into()),
            }),
            concurrency: Some(ConcurrencyConfig {
                num_workers: Some(2),
                request_timeout_secs: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            concurrency: Some(ConcurrencyConfig {
                num_workers: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let concurrency = merged.concurrency.unwrap();
        assert_eq!(concurrency.num_workers, Some(8));
        assert_eq!(concurrency.request_timeout_secs, Some(30));
        assert_eq!(
            merged.contact.unwrap().email.as_deref(),
            Some("base@example.org")
        );
    }

    #[test]
    fn apply_overrides_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            [contact]
            email = "me@example.org"

            [providers]
            disabled = ["unpaywall"]

            [concurrency]
            max_retry_attempts = 5

            [analysis]
            sort_mode = "Order"
            topic_clusters = 3
            reference_year = 2020
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        apply_to(&file, &mut config).unwrap();
        assert_eq!(config.contact_email.as_deref(), Some("me@example.org"));
        assert_eq!(config.disabled_providers, vec!["unpaywall"]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.sort_mode, SortMode::Order);
        assert_eq!(config.clustering.topic.k, 3);
        assert_eq!(config.scoring.reference_year, 2020);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn apply_rejects_unknown_sort_mode() {
        let file: ConfigFile = toml::from_str("[analysis]\nsort_mode = \"title\"\n").unwrap();
        let mut config = Config::default();
        assert!(matches!(
            apply_to(&file, &mut config),
            Err(CoreError::Configuration(_))
        ));
    }

    #[test]
    fn save_then_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ConfigFile {
            analysis: Some(AnalysisConfig {
                topic_seed: Some(7),
                ..Default::default()
            }),
            ..Default::default()
        };
        save_to_path(&config, &path).unwrap();
        assert_eq!(load_from_path(&path), Some(config));
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert_eq!(load_from_path(&path), None);
    }
}
