//! Author and organization communities.
//!
//! References are nodes; two references share an edge weighted by the
//! number of normalized names they have in common. Communities are the
//! connected components over edges of at least `min_edge_weight`.

use std::collections::{BTreeMap, BTreeSet};

use crate::authors::author_key;
use crate::matching::organization_key;
use crate::model::{Cluster, ClusterKind, EnrichedReference, RefId};
use crate::union_find::UnionFind;

/// Normalized name keys of one reference, with a display form for each.
fn names(reference: &EnrichedReference, kind: ClusterKind) -> Vec<(String, String)> {
    let (values, key_fn): (&[String], fn(&str) -> String) = match kind {
        ClusterKind::Author => (reference.authors.value.as_slice(), author_key),
        ClusterKind::Organization => (reference.affiliations.value.as_slice(), organization_key),
        ClusterKind::Topic => return Vec::new(),
    };
    let mut seen = BTreeSet::new();
    values
        .iter()
        .filter_map(|v| {
            let key = key_fn(v);
            (!key.is_empty() && seen.insert(key.clone())).then(|| (key, v.trim().to_string()))
        })
        .collect()
}

/// Partition `refs` into communities of the given kind.
///
/// Cluster ids are assigned in order of each cluster's smallest member id.
pub fn community_clusters(
    refs: &[EnrichedReference],
    kind: ClusterKind,
    min_edge_weight: usize,
) -> Vec<Cluster> {
    let per_ref: Vec<Vec<(String, String)>> = refs.iter().map(|r| names(r, kind)).collect();

    // First display form seen for each key
    let mut display: BTreeMap<&str, &str> = BTreeMap::new();
    let mut postings: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, keys) in per_ref.iter().enumerate() {
        for (key, shown) in keys {
            display.entry(key.as_str()).or_insert(shown.as_str());
            postings.entry(key.as_str()).or_default().push(i);
        }
    }

    let mut weights: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for nodes in postings.values() {
        for (pos, &a) in nodes.iter().enumerate() {
            for &b in &nodes[pos + 1..] {
                *weights.entry((a, b)).or_default() += 1;
            }
        }
    }

    let mut uf = UnionFind::new(refs.len());
    for (&(a, b), &w) in &weights {
        if w >= min_edge_weight {
            uf.union(a, b);
        }
    }

    let mut groups: Vec<Vec<usize>> = uf.groups();
    groups.sort_by_key(|g| g.iter().map(|&i| refs[i].id).min());

    groups
        .into_iter()
        .enumerate()
        .map(|(id, group)| {
            let label = label_for(&group, &per_ref, &display);
            let mut members: Vec<RefId> = group.iter().map(|&i| refs[i].id).collect();
            members.sort_unstable();
            Cluster {
                id,
                kind,
                members,
                label,
            }
        })
        .collect()
}

/// Most frequent name among the members, ties broken alphabetically.
/// A singleton is labelled by its first name.
fn label_for(
    group: &[usize],
    per_ref: &[Vec<(String, String)>],
    display: &BTreeMap<&str, &str>,
) -> Option<String> {
    if let [only] = group {
        return per_ref[*only].first().map(|(_, shown)| shown.clone());
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &i in group {
        for (key, _) in &per_ref[i] {
            *counts.entry(key.as_str()).or_default() += 1;
        }
    }
    // BTreeMap iteration is alphabetical, so the first maximum wins ties
    let mut best: Option<(&str, usize)> = None;
    for (key, count) in counts {
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((key, count));
        }
    }
    best.and_then(|(key, _)| display.get(key).map(|s| s.to_string()))
}
