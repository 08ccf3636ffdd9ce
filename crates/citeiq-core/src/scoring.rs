//! Rule-based quality scoring.
//!
//! Five dimensions each yield a credit in `[0, 1]`: completeness, currency,
//! venue credibility, integrity and impact. The score is their weighted mean
//! scaled to 100, minus a flat penalty for retracted works, clipped to
//! `[0, 100]`. Scoring is a pure function of the reconciled reference, the
//! flags accumulated for it so far and an injected [`ScoringConfig`].

use std::collections::BTreeSet;

use chrono::Datelike;

use crate::CoreError;
use crate::model::{EnrichedReference, Field, Flag, QualityReport, ScoreBreakdown, VenueKind};

/// Relative weight of each dimension. Only the ratios matter.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub completeness: f64,
    pub currency: f64,
    pub venue: f64,
    pub integrity: f64,
    pub impact: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            completeness: 25.0,
            currency: 20.0,
            venue: 20.0,
            integrity: 30.0,
            impact: 5.0,
        }
    }
}

impl ScoringWeights {
    fn as_array(&self) -> [f64; 5] {
        [
            self.completeness,
            self.currency,
            self.venue,
            self.integrity,
            self.impact,
        ]
    }

    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Year ages are measured against.
    pub reference_year: i32,
    /// Age up to which currency is full.
    pub currency_threshold_years: u32,
    /// Years over which currency then decays linearly to zero.
    pub currency_decay_years: u32,
    pub unknown_year_credit: f64,
    pub peer_reviewed_credit: f64,
    pub unknown_venue_credit: f64,
    pub preprint_credit: f64,
    pub retraction_deduction: f64,
    pub unresolved_doi_deduction: f64,
    pub mismatch_deduction: f64,
    pub duplicate_deduction: f64,
    /// Points subtracted from the final score of a retracted work.
    pub retraction_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            reference_year: chrono::Utc::now().year(),
            currency_threshold_years: 10,
            currency_decay_years: 10,
            unknown_year_credit: 0.5,
            peer_reviewed_credit: 1.0,
            unknown_venue_credit: 0.6,
            preprint_credit: 0.4,
            retraction_deduction: 1.0,
            unresolved_doi_deduction: 0.4,
            mismatch_deduction: 0.3,
            duplicate_deduction: 0.3,
            retraction_penalty: 40.0,
        }
    }
}

impl ScoringConfig {
    /// Defaults pinned to a fixed year.
    pub fn for_year(reference_year: i32) -> Self {
        Self {
            reference_year,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let weights = self.weights.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CoreError::Configuration(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        if self.weights.total() <= 0.0 {
            return Err(CoreError::Configuration(
                "scoring weights must not all be zero".into(),
            ));
        }
        let unit = [
            ("unknown_year_credit", self.unknown_year_credit),
            ("peer_reviewed_credit", self.peer_reviewed_credit),
            ("unknown_venue_credit", self.unknown_venue_credit),
            ("preprint_credit", self.preprint_credit),
            ("retraction_deduction", self.retraction_deduction),
            ("unresolved_doi_deduction", self.unresolved_doi_deduction),
            ("mismatch_deduction", self.mismatch_deduction),
            ("duplicate_deduction", self.duplicate_deduction),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.retraction_penalty) {
            return Err(CoreError::Configuration(format!(
                "retraction_penalty must be within [0, 100], got {}",
                self.retraction_penalty
            )));
        }
        Ok(())
    }
}

/// Score one reference.
///
/// `accumulated` holds flags raised outside the reference itself (e.g.
/// `duplicate`); the reference's own reconciliation flags are always
/// included.
pub fn score(
    reference: &EnrichedReference,
    accumulated: &BTreeSet<Flag>,
    duplicate_group_id: Option<usize>,
    config: &ScoringConfig,
) -> QualityReport {
    let mut flags: BTreeSet<Flag> = reference.flags.union(accumulated).copied().collect();

    let breakdown = ScoreBreakdown {
        completeness: completeness(reference, &mut flags),
        currency: currency(reference, config, &mut flags),
        venue: venue(reference, config, &mut flags),
        integrity: integrity(reference, config, &mut flags),
        impact: impact(reference),
    };

    let credits = [
        breakdown.completeness,
        breakdown.currency,
        breakdown.venue,
        breakdown.integrity,
        breakdown.impact,
    ];
    let weights = config.weights.as_array();
    let weighted: f64 = weights.iter().zip(credits).map(|(w, c)| w * c).sum();
    let total_weight = config.weights.total();

    let mut value = if total_weight > 0.0 {
        100.0 * weighted / total_weight
    } else {
        0.0
    };
    if flags.contains(&Flag::Retracted) {
        value -= config.retraction_penalty;
    }

    QualityReport {
        score: clamp_score(value),
        flags,
        duplicate_group_id,
        breakdown,
    }
}

/// Clip to `[0, 100]` and round to two decimals. NaN scores zero.
fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

fn completeness(reference: &EnrichedReference, flags: &mut BTreeSet<Flag>) -> f64 {
    let mut present = 0;
    for field in Field::ALL {
        if reference.has(field) {
            present += 1;
        } else {
            flags.insert(Flag::MissingField(field));
        }
    }
    present as f64 / Field::ALL.len() as f64
}

fn currency(reference: &EnrichedReference, config: &ScoringConfig, flags: &mut BTreeSet<Flag>) -> f64 {
    let Some(year) = reference.year_value() else {
        return config.unknown_year_credit;
    };
    let age = config.reference_year.saturating_sub(year).max(0) as u32;
    if age <= config.currency_threshold_years {
        return 1.0;
    }
    flags.insert(Flag::Outdated);
    if config.currency_decay_years == 0 {
        return 0.0;
    }
    let over = (age - config.currency_threshold_years) as f64;
    (1.0 - over / config.currency_decay_years as f64).max(0.0)
}

fn venue(reference: &EnrichedReference, config: &ScoringConfig, flags: &mut BTreeSet<Flag>) -> f64 {
    match reference.venue_kind.value {
        VenueKind::PeerReviewed => config.peer_reviewed_credit,
        VenueKind::Unknown => config.unknown_venue_credit,
        VenueKind::Preprint => {
            flags.insert(Flag::Preprint);
            config.preprint_credit
        }
    }
}

fn integrity(reference: &EnrichedReference, config: &ScoringConfig, flags: &mut BTreeSet<Flag>) -> f64 {
    if reference.is_retracted() {
        flags.insert(Flag::Retracted);
    }
    let mut credit = 1.0;
    if flags.contains(&Flag::Retracted) {
        credit -= config.retraction_deduction;
    }
    if flags.contains(&Flag::UnresolvedDoi) {
        credit -= config.unresolved_doi_deduction;
    }
    if flags.contains(&Flag::MetadataMismatch) {
        credit -= config.mismatch_deduction;
    }
    if flags.contains(&Flag::Duplicate) {
        credit -= config.duplicate_deduction;
    }
    f64::max(credit, 0.0)
}

/// `2·sqrt(citations)` on a ten-point scale, saturating at 25 citations.
fn impact(reference: &EnrichedReference) -> f64 {
    match reference.citation_count.as_ref() {
        Some(count) => (2.0 * (count.value as f64).sqrt() / 10.0).min(1.0),
        None => 0.0,
    }
}
