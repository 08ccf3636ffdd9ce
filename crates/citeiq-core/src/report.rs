//! The final in-memory analysis report: ordered entries, clusters and
//! batch-level statistics.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::CoreError;
use crate::authors::{author_key, get_last_name};
use crate::matching::organization_key;
use crate::model::{Cluster, ClusterKind, EnrichedReference, QualityReport, RefId};

/// Order of the report entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// First-author surname, then year.
    #[default]
    Author,
    /// Newest first.
    Year,
    /// Input order.
    Order,
}

impl FromStr for SortMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "author" => Ok(SortMode::Author),
            "year" => Ok(SortMode::Year),
            "order" => Ok(SortMode::Order),
            other => Err(CoreError::Configuration(format!(
                "unknown sort mode {other:?} (expected author, year or order)"
            ))),
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortMode::Author => "author",
            SortMode::Year => "year",
            SortMode::Order => "order",
        })
    }
}

/// One analysed reference with its score and cluster memberships.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub reference: EnrichedReference,
    pub quality: QualityReport,
    pub author_cluster: usize,
    pub organization_cluster: usize,
    pub topic_cluster: usize,
}

impl ReportEntry {
    pub fn id(&self) -> RefId {
        self.reference.id
    }

    pub fn cluster(&self, kind: ClusterKind) -> usize {
        match kind {
            ClusterKind::Author => self.author_cluster,
            ClusterKind::Organization => self.organization_cluster,
            ClusterKind::Topic => self.topic_cluster,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub id: usize,
    pub kind: ClusterKind,
    pub size: usize,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total: usize,
    /// Flag display name to number of references carrying it.
    pub flag_counts: BTreeMap<String, usize>,
    /// Zero for an empty batch.
    pub mean_score: f64,
    pub clusters: Vec<ClusterSummary>,
    pub top_authors: Vec<(String, usize)>,
    pub top_organizations: Vec<(String, usize)>,
    pub open_access: usize,
    pub preprints: usize,
    pub retracted: usize,
    pub duplicate_groups: usize,
}

impl AggregateStats {
    pub fn compute(
        entries: &[ReportEntry],
        clusters: &[Cluster],
        duplicate_groups: usize,
        top_n: usize,
    ) -> Self {
        let mut flag_counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in entries {
            for flag in &entry.quality.flags {
                *flag_counts.entry(flag.to_string()).or_default() += 1;
            }
        }

        let mean_score = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|e| e.quality.score).sum::<f64>() / entries.len() as f64
        };

        let refs = entries.iter().map(|e| &e.reference);
        Self {
            total: entries.len(),
            flag_counts,
            mean_score,
            clusters: clusters
                .iter()
                .map(|c| ClusterSummary {
                    id: c.id,
                    kind: c.kind,
                    size: c.members.len(),
                    label: c.label.clone(),
                })
                .collect(),
            top_authors: top_entities(refs.clone().map(|r| r.authors.value.as_slice()), author_key, top_n),
            top_organizations: top_entities(
                refs.clone().map(|r| r.affiliations.value.as_slice()),
                organization_key,
                top_n,
            ),
            open_access: refs.clone().filter(|r| r.oa_url.is_some()).count(),
            preprints: refs.clone().filter(|r| r.is_preprint()).count(),
            retracted: refs.filter(|r| r.is_retracted()).count(),
            duplicate_groups,
        }
    }

    pub fn flag_count(&self, name: &str) -> usize {
        self.flag_counts.get(name).copied().unwrap_or(0)
    }
}

/// Most frequent names, counted once per reference.
///
/// Names are compared by `key_fn`; each is displayed in the first form seen.
/// Ties are ordered by key.
fn top_entities<'a>(
    lists: impl Iterator<Item = &'a [String]>,
    key_fn: fn(&str) -> String,
    top_n: usize,
) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, (usize, &'a str)> = BTreeMap::new();
    for names in lists {
        let mut seen = BTreeSet::new();
        for name in names {
            let key = key_fn(name);
            if key.is_empty() || !seen.insert(key.clone()) {
                continue;
            }
            counts.entry(key).or_insert((0, name.trim())).0 += 1;
        }
    }
    let mut ranked: Vec<(String, usize, &str)> = counts
        .into_iter()
        .map(|(key, (count, shown))| (key, count, shown))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(top_n)
        .map(|(_, count, shown)| (shown.to_string(), count))
        .collect()
}

/// Order entries in place. Ties always fall back to input order.
pub fn sort_entries(entries: &mut [ReportEntry], mode: SortMode) {
    match mode {
        SortMode::Author => entries.sort_by_cached_key(|e| {
            let surname = e
                .reference
                .authors
                .value
                .first()
                .map(|a| get_last_name(a))
                .unwrap_or_default();
            // References without an author go last
            (surname.is_empty(), surname, e.reference.year_value(), e.id())
        }),
        SortMode::Year => entries.sort_by_key(|e| {
            let year = e.reference.year_value();
            (year.is_none(), Reverse(year), e.id())
        }),
        SortMode::Order => entries.sort_by_key(ReportEntry::id),
    }
}

/// Everything the engine produces for one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    /// One entry per input reference, in the configured sort order.
    pub entries: Vec<ReportEntry>,
    /// Author, organization and topic clusters, grouped by kind.
    pub clusters: Vec<Cluster>,
    pub stats: AggregateStats,
}

impl AnalysisReport {
    pub fn entry(&self, id: RefId) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn clusters_of(&self, kind: ClusterKind) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter(move |c| c.kind == kind)
    }
}
