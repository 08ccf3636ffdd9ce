//! Duplicate detection over reconciled references.
//!
//! References are blocked by (first-author surname, year) so only plausible
//! pairs are compared. Within a block a pair matches when the Jaccard
//! similarity of their title words plus author surnames reaches the
//! threshold. Identical DOIs match regardless of block. Matches are closed
//! transitively with union-find.

use std::collections::{BTreeMap, BTreeSet};

use crate::CoreError;
use crate::authors::get_last_name;
use crate::matching::word_tokens;
use crate::model::{EnrichedReference, RefId};
use crate::union_find::UnionFind;

#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Minimum Jaccard similarity for a within-block match.
    pub jaccard_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            jaccard_threshold: 0.8,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.jaccard_threshold > 0.0 && self.jaccard_threshold <= 1.0) {
            return Err(CoreError::Configuration(format!(
                "jaccard_threshold must be within (0, 1], got {}",
                self.jaccard_threshold
            )));
        }
        Ok(())
    }
}

/// A set of references judged to be the same work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub id: usize,
    /// Lowest input index in the group; the only member not flagged.
    pub canonical: RefId,
    /// All members, ascending, canonical included.
    pub members: Vec<RefId>,
}

/// Every duplicate group of a batch. References in no group are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateGroups {
    pub groups: Vec<DuplicateGroup>,
    by_ref: BTreeMap<RefId, usize>,
}

impl DuplicateGroups {
    pub fn group_of(&self, id: RefId) -> Option<usize> {
        self.by_ref.get(&id).copied()
    }

    /// In a group and not its canonical member.
    pub fn is_duplicate(&self, id: RefId) -> bool {
        self.group_of(id)
            .and_then(|g| self.groups.get(g))
            .is_some_and(|g| g.canonical != id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Blocking key: normalized first-author surname plus year.
fn block_key(reference: &EnrichedReference) -> (String, Option<i32>) {
    let surname = reference
        .authors
        .value
        .first()
        .map(|a| get_last_name(a))
        .unwrap_or_default();
    (surname, reference.year_value())
}

/// Title words plus every author surname.
fn comparison_tokens(reference: &EnrichedReference) -> BTreeSet<String> {
    let mut tokens = word_tokens(reference.title_str());
    tokens.extend(
        reference
            .authors
            .value
            .iter()
            .map(|a| get_last_name(a))
            .filter(|s| !s.is_empty()),
    );
    tokens
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Group near-identical references.
pub fn find_duplicates(refs: &[EnrichedReference], config: &DedupConfig) -> DuplicateGroups {
    let mut uf = UnionFind::new(refs.len());

    let mut by_doi: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, r) in refs.iter().enumerate() {
        if let Some(doi) = r.doi_str() {
            by_doi.entry(doi).or_default().push(i);
        }
    }
    for members in by_doi.values() {
        for &other in &members[1..] {
            uf.union(members[0], other);
        }
    }

    let mut blocks: BTreeMap<(String, Option<i32>), Vec<usize>> = BTreeMap::new();
    for (i, r) in refs.iter().enumerate() {
        blocks.entry(block_key(r)).or_default().push(i);
    }

    let tokens: Vec<BTreeSet<String>> = refs.iter().map(comparison_tokens).collect();
    for members in blocks.values().filter(|m| m.len() > 1) {
        for (pos, &a) in members.iter().enumerate() {
            for &b in &members[pos + 1..] {
                if jaccard(&tokens[a], &tokens[b]) >= config.jaccard_threshold {
                    uf.union(a, b);
                }
            }
        }
    }

    let mut sets: Vec<Vec<RefId>> = uf
        .groups()
        .into_iter()
        .filter(|g| g.len() > 1)
        .map(|g| {
            let mut ids: Vec<RefId> = g.into_iter().map(|i| refs[i].id).collect();
            ids.sort_unstable();
            ids
        })
        .collect();
    sets.sort_by_key(|ids| ids[0]);

    let mut result = DuplicateGroups::default();
    for (id, members) in sets.into_iter().enumerate() {
        for &m in &members {
            result.by_ref.insert(m, id);
        }
        tracing::debug!(group = id, members = ?members, "duplicate group");
        result.groups.push(DuplicateGroup {
            id,
            canonical: members[0],
            members,
        });
    }
    result
}
