use serde::{Deserialize, Serialize};

use crate::doi::normalize_doi;
use crate::provider::crossref::{WireRelation, WireUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractionKind {
    Retraction,
    Removal,
    Withdrawal,
    ExpressionOfConcern,
}

impl RetractionKind {
    /// Expressions of concern are recorded but do not retract the work.
    pub fn is_retraction(&self) -> bool {
        !matches!(self, RetractionKind::ExpressionOfConcern)
    }

    fn from_update_type(update_type: &str) -> Option<Self> {
        match update_type.to_lowercase().as_str() {
            "retraction" => Some(RetractionKind::Retraction),
            "removal" => Some(RetractionKind::Removal),
            "withdrawal" => Some(RetractionKind::Withdrawal),
            "expression_of_concern" | "expression-of-concern" => {
                Some(RetractionKind::ExpressionOfConcern)
            }
            _ => None,
        }
    }
}

/// A retraction or concern notice attached to a work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetractionNotice {
    pub kind: RetractionKind,
    /// DOI of the notice itself, when the registry links one.
    pub notice_doi: Option<String>,
}

/// Extract the strongest notice from a Crossref work's `update-to` and
/// `relation` fields.
///
/// A real retraction always wins over an expression of concern.
pub(crate) fn notice_from_crossref(
    updates: &[WireUpdate],
    relation: Option<&WireRelation>,
) -> Option<RetractionNotice> {
    let mut concern: Option<RetractionNotice> = None;

    for update in updates {
        let Some(kind) = update
            .update_type
            .as_deref()
            .and_then(RetractionKind::from_update_type)
        else {
            continue;
        };
        let notice = RetractionNotice {
            kind,
            notice_doi: update.doi.as_deref().map(normalize_doi),
        };
        if kind.is_retraction() {
            return Some(notice);
        }
        concern.get_or_insert(notice);
    }

    if let Some(relation) = relation {
        if let Some(first) = relation.is_retracted_by.first() {
            return Some(RetractionNotice {
                kind: RetractionKind::Retraction,
                notice_doi: first.id.as_deref().map(normalize_doi),
            });
        }
        if let Some(first) = relation.has_expression_of_concern.first() {
            concern.get_or_insert(RetractionNotice {
                kind: RetractionKind::ExpressionOfConcern,
                notice_doi: first.id.as_deref().map(normalize_doi),
            });
        }
    }

    concern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::crossref::WireRelated;

    fn update(kind: &str, doi: &str) -> WireUpdate {
        WireUpdate {
            update_type: Some(kind.into()),
            doi: Some(doi.into()),
        }
    }

    #[test]
    fn no_notices() {
        assert_eq!(notice_from_crossref(&[], None), None);
    }

    #[test]
    fn update_to_retraction() {
        let notice = notice_from_crossref(&[update("retraction", "10.1000/RETRACT")], None).unwrap();
        assert_eq!(notice.kind, RetractionKind::Retraction);
        assert_eq!(notice.notice_doi.as_deref(), Some("10.1000/retract"));
    }

    #[test]
    fn unrelated_update_ignored() {
        assert_eq!(
            notice_from_crossref(&[update("correction", "10.1000/fix")], None),
            None
        );
    }

    #[test]
    fn retraction_beats_concern() {
        let notice = notice_from_crossref(
            &[
                update("expression_of_concern", "10.1000/eoc"),
                update("removal", "10.1000/gone"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(notice.kind, RetractionKind::Removal);
    }

    #[test]
    fn relation_retracted_by() {
        let relation = WireRelation {
            is_retracted_by: vec![WireRelated {
                id: Some("10.1000/notice".into()),
            }],
            has_expression_of_concern: vec![],
        };
        let notice = notice_from_crossref(&[], Some(&relation)).unwrap();
        assert!(notice.kind.is_retraction());
    }

    #[test]
    fn concern_only_is_not_a_retraction() {
        let relation = WireRelation {
            is_retracted_by: vec![],
            has_expression_of_concern: vec![WireRelated { id: None }],
        };
        let notice = notice_from_crossref(&[], Some(&relation)).unwrap();
        assert_eq!(notice.kind, RetractionKind::ExpressionOfConcern);
        assert!(!notice.kind.is_retraction());
    }
}
