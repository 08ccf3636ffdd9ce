//! Core data model shared by every analysis stage.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::retraction::RetractionNotice;

/// Identifier of a reference within one batch: its input index.
pub type RefId = usize;

/// A normalized citation record as produced by the ingestion layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReference {
    pub source_file: String,
    /// Position in the input batch. Unique per batch.
    pub input_index: usize,
    pub raw_text: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub doi: Option<String>,
    /// Organization strings, when the ingestion layer found any.
    #[serde(default)]
    pub affiliations: Vec<String>,
}

impl RawReference {
    pub fn id(&self) -> RefId {
        self.input_index
    }

    pub fn first_author(&self) -> Option<&str> {
        self.authors
            .iter()
            .map(|a| a.trim())
            .find(|a| !a.is_empty())
    }
}

/// Where a reconciled field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    Raw,
    Crossref,
    OpenAlex,
    Unpaywall,
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldSource::Raw => "raw",
            FieldSource::Crossref => "crossref",
            FieldSource::OpenAlex => "openalex",
            FieldSource::Unpaywall => "unpaywall",
        };
        f.write_str(name)
    }
}

/// A value tagged with the source that won reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: FieldSource,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: FieldSource) -> Self {
        Self { value, source }
    }
}

/// Publication channel classification used for venue credibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    PeerReviewed,
    Preprint,
    #[default]
    Unknown,
}

/// Fields whose absence the scorer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Doi,
    Abstract,
    Venue,
    Year,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Doi, Field::Abstract, Field::Venue, Field::Year];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Doi => "doi",
            Field::Abstract => "abstract",
            Field::Venue => "venue",
            Field::Year => "year",
        }
    }
}

/// Closed set of quality flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flag {
    Duplicate,
    Retracted,
    Preprint,
    UnresolvedDoi,
    MetadataMismatch,
    Outdated,
    MissingField(Field),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Duplicate => f.write_str("duplicate"),
            Flag::Retracted => f.write_str("retracted"),
            Flag::Preprint => f.write_str("preprint"),
            Flag::UnresolvedDoi => f.write_str("unresolved_doi"),
            Flag::MetadataMismatch => f.write_str("metadata_mismatch"),
            Flag::Outdated => f.write_str("outdated"),
            Flag::MissingField(field) => write!(f, "missing_field:{}", field.name()),
        }
    }
}

/// The reconciled view of one reference. Built once, then read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedReference {
    pub id: RefId,
    pub source_file: String,
    pub title: Option<Sourced<String>>,
    pub authors: Sourced<Vec<String>>,
    pub year: Option<Sourced<i32>>,
    pub venue: Option<Sourced<String>>,
    pub venue_kind: Sourced<VenueKind>,
    pub doi: Option<Sourced<String>>,
    pub abstract_text: Option<Sourced<String>>,
    pub oa_url: Option<Sourced<String>>,
    pub citation_count: Option<Sourced<u64>>,
    pub retraction: Option<Sourced<RetractionNotice>>,
    pub affiliations: Sourced<Vec<String>>,
    pub topics: Vec<String>,
    /// Validation flags raised while reconciling.
    pub flags: BTreeSet<Flag>,
}

impl EnrichedReference {
    pub fn title_str(&self) -> &str {
        self.title.as_ref().map(|t| t.value.as_str()).unwrap_or("")
    }

    pub fn year_value(&self) -> Option<i32> {
        self.year.as_ref().map(|y| y.value)
    }

    pub fn doi_str(&self) -> Option<&str> {
        self.doi.as_ref().map(|d| d.value.as_str())
    }

    pub fn is_retracted(&self) -> bool {
        self.retraction
            .as_ref()
            .is_some_and(|r| r.value.kind.is_retraction())
    }

    pub fn is_preprint(&self) -> bool {
        self.venue_kind.value == VenueKind::Preprint
    }

    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::Doi => self.doi.is_some(),
            Field::Abstract => self
                .abstract_text
                .as_ref()
                .is_some_and(|a| !a.value.trim().is_empty()),
            Field::Venue => self
                .venue
                .as_ref()
                .is_some_and(|v| !v.value.trim().is_empty()),
            Field::Year => self.year.is_some(),
        }
    }
}

/// Per-dimension credits, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub completeness: f64,
    pub currency: f64,
    pub venue: f64,
    pub integrity: f64,
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Always within `[0, 100]`.
    pub score: f64,
    pub flags: BTreeSet<Flag>,
    pub duplicate_group_id: Option<usize>,
    pub breakdown: ScoreBreakdown,
}

impl QualityReport {
    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(Flag::to_string).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Author,
    Organization,
    Topic,
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterKind::Author => "author",
            ClusterKind::Organization => "organization",
            ClusterKind::Topic => "topic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique within its kind.
    pub id: usize,
    pub kind: ClusterKind,
    /// Member reference ids, ascending.
    pub members: Vec<RefId>,
    pub label: Option<String>,
}
