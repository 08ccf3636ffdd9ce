//! Merge provider results and the raw record into one [`EnrichedReference`].
//!
//! Each field is resolved by a fixed per-field source precedence and tagged
//! with the winning source. Disagreement between sources never blocks
//! resolution; it only raises `metadata_mismatch`. The function is pure:
//! no clocks, no I/O, no hash-order dependence.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::CoreError;
use crate::doi::{is_preprint_doi, is_valid_doi, normalize_doi, parse_doi};
use crate::matching::{normalize_words, title_similarity};
use crate::model::{EnrichedReference, FieldSource, Flag, RawReference, Sourced, VenueKind};
use crate::provider::{CrossrefWork, OpenAlexWork, ProviderResults};
use crate::retraction::{RetractionKind, RetractionNotice};

/// Thresholds for conflict detection between sources.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Title pairs less similar than this raise `metadata_mismatch`.
    pub title_similarity_threshold: f64,
    /// Year pairs further apart than this raise `metadata_mismatch`.
    pub year_tolerance: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            title_similarity_threshold: 0.85,
            year_tolerance: 1,
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.title_similarity_threshold) {
            return Err(CoreError::Configuration(format!(
                "title_similarity_threshold must be within [0, 1], got {}",
                self.title_similarity_threshold
            )));
        }
        Ok(())
    }
}

static PREPRINT_VENUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(arxiv|biorxiv|medrxiv|chemrxiv|ssrn|preprints?)\b").unwrap());

/// First present candidate, tagged with its source.
fn pick<T>(candidates: impl IntoIterator<Item = (Option<T>, FieldSource)>) -> Option<Sourced<T>> {
    candidates
        .into_iter()
        .find_map(|(value, source)| value.map(|v| Sourced::new(v, source)))
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty_list(list: &[String]) -> Option<Vec<String>> {
    let cleaned: Vec<String> = list
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn valid_doi(doi: Option<&String>) -> Option<String> {
    doi.map(|d| normalize_doi(d)).filter(|d| is_valid_doi(d))
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_lowercase()))
        .collect()
}

/// Build the reconciled view of one reference.
pub fn reconcile(
    raw: &RawReference,
    results: &ProviderResults,
    config: &ReconcileConfig,
) -> EnrichedReference {
    use FieldSource::{Crossref, OpenAlex, Raw, Unpaywall};

    let crossref = results.crossref();
    let openalex = results.openalex();
    let unpaywall = results.unpaywall();
    let mut flags = BTreeSet::new();

    let title = pick([
        (crossref.and_then(|w| non_empty(w.title.as_deref())), Crossref),
        (openalex.and_then(|w| non_empty(w.title.as_deref())), OpenAlex),
        (non_empty(raw.title.as_deref()), Raw),
    ]);

    let authors = pick([
        (crossref.and_then(|w| non_empty_list(&w.authors)), Crossref),
        (openalex.and_then(|w| non_empty_list(&w.authors)), OpenAlex),
    ])
    .unwrap_or_else(|| Sourced::new(non_empty_list(&raw.authors).unwrap_or_default(), Raw));

    let year = pick([
        (crossref.and_then(|w| w.year), Crossref),
        (openalex.and_then(|w| w.year), OpenAlex),
        (raw.year, Raw),
    ]);

    let venue = pick([
        (crossref.and_then(|w| non_empty(w.venue.as_deref())), Crossref),
        (openalex.and_then(|w| non_empty(w.venue.as_deref())), OpenAlex),
        (non_empty(raw.venue.as_deref()), Raw),
    ]);

    let raw_doi = raw.doi.as_deref().and_then(parse_doi);
    let doi = pick([
        (raw_doi.clone(), Raw),
        (valid_doi(crossref.and_then(|w| w.doi.as_ref())), Crossref),
        (valid_doi(openalex.and_then(|w| w.doi.as_ref())), OpenAlex),
        (valid_doi(unpaywall.and_then(|r| r.doi.as_ref())), Unpaywall),
    ]);

    let raw_doi_malformed = non_empty(raw.doi.as_deref()).is_some() && raw_doi.is_none();
    // Only lookups keyed by the cited DOI can show that it does not resolve
    let raw_doi_not_found = raw_doi.is_some() && results.doi_lookups_not_found();
    if raw_doi_malformed || doi.is_none() || raw_doi_not_found {
        flags.insert(Flag::UnresolvedDoi);
    }

    let abstract_text = pick([
        (openalex.and_then(|w| non_empty(w.abstract_text.as_deref())), OpenAlex),
        (crossref.and_then(|w| non_empty(w.abstract_text.as_deref())), Crossref),
    ]);

    let oa_url = pick([(unpaywall.and_then(|r| non_empty(r.oa_url.as_deref())), Unpaywall)]);

    let citation_count = pick([
        (openalex.and_then(|w| w.citation_count), OpenAlex),
        (crossref.and_then(|w| w.citation_count), Crossref),
    ]);

    let retraction = resolve_retraction(crossref, openalex);

    let affiliations = pick([
        (openalex.and_then(|w| non_empty_list(&w.institutions)), OpenAlex),
        (crossref.and_then(|w| non_empty_list(&w.affiliations)), Crossref),
        (non_empty_list(&raw.affiliations), Raw),
    ])
    .map(|s| Sourced::new(dedup_preserving_order(s.value), s.source))
    .unwrap_or_else(|| Sourced::new(Vec::new(), Raw));

    let topics = openalex.map(|w| w.concepts.clone()).unwrap_or_default();

    let venue_kind = classify_venue(crossref, openalex, doi.as_ref(), venue.as_ref());

    if has_conflict(raw, crossref, openalex, config) {
        flags.insert(Flag::MetadataMismatch);
    }

    EnrichedReference {
        id: raw.id(),
        source_file: raw.source_file.clone(),
        title,
        authors,
        year,
        venue,
        venue_kind,
        doi,
        abstract_text,
        oa_url,
        citation_count,
        retraction,
        affiliations,
        topics,
        flags,
    }
}

/// A Crossref retraction wins; an OpenAlex `is_retracted` beats a Crossref
/// expression of concern.
fn resolve_retraction(
    crossref: Option<&CrossrefWork>,
    openalex: Option<&OpenAlexWork>,
) -> Option<Sourced<RetractionNotice>> {
    let crossref_notice = crossref.and_then(|w| w.retraction.clone());
    if let Some(notice) = crossref_notice.as_ref().filter(|n| n.kind.is_retraction()) {
        return Some(Sourced::new(notice.clone(), FieldSource::Crossref));
    }
    if openalex.is_some_and(|w| w.is_retracted) {
        return Some(Sourced::new(
            RetractionNotice {
                kind: RetractionKind::Retraction,
                notice_doi: None,
            },
            FieldSource::OpenAlex,
        ));
    }
    crossref_notice.map(|n| Sourced::new(n, FieldSource::Crossref))
}

/// Crossref work type, then OpenAlex work/source type, then DOI and
/// venue-name patterns.
fn classify_venue(
    crossref: Option<&CrossrefWork>,
    openalex: Option<&OpenAlexWork>,
    doi: Option<&Sourced<String>>,
    venue: Option<&Sourced<String>>,
) -> Sourced<VenueKind> {
    if let Some(work_type) = crossref.and_then(|w| w.work_type.as_deref()) {
        let kind = match work_type {
            "posted-content" => Some(VenueKind::Preprint),
            "journal-article" | "proceedings-article" | "book-chapter" => {
                Some(VenueKind::PeerReviewed)
            }
            _ => None,
        };
        if let Some(kind) = kind {
            return Sourced::new(kind, FieldSource::Crossref);
        }
    }

    if let Some(work) = openalex {
        let source_type = work.source_type.as_deref();
        let kind = if work.work_type.as_deref() == Some("preprint")
            || source_type == Some("repository")
        {
            Some(VenueKind::Preprint)
        } else if matches!(source_type, Some("journal" | "conference")) {
            Some(VenueKind::PeerReviewed)
        } else {
            None
        };
        if let Some(kind) = kind {
            return Sourced::new(kind, FieldSource::OpenAlex);
        }
    }

    if let Some(doi) = doi.filter(|d| is_preprint_doi(&d.value)) {
        return Sourced::new(VenueKind::Preprint, doi.source);
    }
    if let Some(venue) = venue.filter(|v| PREPRINT_VENUE.is_match(&v.value)) {
        return Sourced::new(VenueKind::Preprint, venue.source);
    }
    Sourced::new(VenueKind::Unknown, FieldSource::Raw)
}

/// Any two title candidates too dissimilar, or any two year candidates too
/// far apart.
fn has_conflict(
    raw: &RawReference,
    crossref: Option<&CrossrefWork>,
    openalex: Option<&OpenAlexWork>,
    config: &ReconcileConfig,
) -> bool {
    let titles: Vec<&str> = [
        raw.title.as_deref(),
        crossref.and_then(|w| w.title.as_deref()),
        openalex.and_then(|w| w.title.as_deref()),
    ]
    .into_iter()
    .flatten()
    .filter(|t| !normalize_words(t).is_empty())
    .collect();

    for (i, a) in titles.iter().enumerate() {
        for b in &titles[i + 1..] {
            if title_similarity(a, b) < config.title_similarity_threshold {
                return true;
            }
        }
    }

    let years: Vec<i32> = [
        raw.year,
        crossref.and_then(|w| w.year),
        openalex.and_then(|w| w.year),
    ]
    .into_iter()
    .flatten()
    .collect();

    years.iter().enumerate().any(|(i, a)| {
        years[i + 1..]
            .iter()
            .any(|b| a.abs_diff(*b) > config.year_tolerance)
    })
}
