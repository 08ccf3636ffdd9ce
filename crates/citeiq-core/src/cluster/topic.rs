//! Topic clusters: TF-IDF vectors over title + abstract, grouped with
//! seeded k-means (k-means++ initialisation).
//!
//! Identical input and seed always give identical clusters.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;

use crate::CoreError;
use crate::matching::normalize_words;
use crate::model::{Cluster, ClusterKind, EnrichedReference, RefId};

#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    /// Upper bound on the number of clusters; capped at the batch size.
    pub k: usize,
    pub seed: u64,
    pub max_iterations: usize,
    /// Centroid terms used as the cluster label.
    pub label_terms: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            k: 8,
            seed: 42,
            max_iterations: 100,
            label_terms: 5,
        }
    }
}

impl TopicConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.k == 0 {
            return Err(CoreError::Configuration("topic k must be >= 1".into()));
        }
        if self.max_iterations == 0 {
            return Err(CoreError::Configuration(
                "topic max_iterations must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and",
        "any", "are", "as", "at", "be", "because", "been", "before", "being", "below",
        "between", "both", "but", "by", "can", "could", "did", "do", "does", "doing", "down",
        "during", "each", "et", "etc", "few", "for", "from", "further", "had", "has", "have",
        "having", "he", "her", "here", "hers", "him", "his", "how", "however", "i", "if", "in",
        "into", "is", "it", "its", "itself", "may", "me", "more", "most", "must", "my", "no",
        "nor", "not", "of", "off", "on", "once", "only", "or", "other", "our", "ours", "out",
        "over", "own", "same", "she", "should", "so", "some", "such", "than", "that", "the",
        "their", "them", "then", "there", "these", "they", "this", "those", "through", "thus",
        "to", "too", "under", "until", "up", "upon", "using", "very", "via", "was", "we",
        "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will",
        "with", "within", "without", "would", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Lowercase alphanumeric tokens of length >= 2, minus stopwords and pure numbers.
pub fn tokenize(text: &str) -> Vec<String> {
    normalize_words(text)
        .split(' ')
        .filter(|t| t.len() >= 2)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Sparse L2-normalized TF-IDF vector: sorted `(term column, weight)` pairs.
type SparseVec = Vec<(usize, f64)>;

struct Corpus {
    terms: Vec<String>,
    docs: Vec<SparseVec>,
}

/// TF-IDF with smoothed idf `ln((1 + n) / (1 + df)) + 1`, rows L2-normalized.
fn vectorize(texts: &[String]) -> Corpus {
    let tokenized: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();

    let mut vocab: BTreeMap<&str, usize> = BTreeMap::new();
    for tokens in &tokenized {
        for t in tokens {
            vocab.entry(t.as_str()).or_insert(0);
        }
    }
    for (column, slot) in vocab.values_mut().enumerate() {
        *slot = column;
    }
    let terms: Vec<String> = vocab.keys().map(|t| t.to_string()).collect();

    let mut df = vec![0usize; terms.len()];
    let counts: Vec<BTreeMap<usize, usize>> = tokenized
        .iter()
        .map(|tokens| {
            let mut tf: BTreeMap<usize, usize> = BTreeMap::new();
            for t in tokens {
                *tf.entry(vocab[t.as_str()]).or_default() += 1;
            }
            for &column in tf.keys() {
                df[column] += 1;
            }
            tf
        })
        .collect();

    let n = texts.len() as f64;
    let idf: Vec<f64> = df
        .iter()
        .map(|&d| ((1.0 + n) / (1.0 + d as f64)).ln() + 1.0)
        .collect();

    let docs = counts
        .into_iter()
        .map(|tf| {
            let mut row: SparseVec = tf
                .into_iter()
                .map(|(column, count)| (column, count as f64 * idf[column]))
                .collect();
            let norm = row.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                for (_, w) in &mut row {
                    *w /= norm;
                }
            }
            row
        })
        .collect();

    Corpus { terms, docs }
}

fn sq_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Squared Euclidean distance between a sparse row and a dense centroid.
fn sq_distance(doc: &SparseVec, doc_sq_norm: f64, centroid: &[f64], centroid_sq_norm: f64) -> f64 {
    let dot: f64 = doc.iter().map(|&(c, w)| w * centroid[c]).sum();
    (doc_sq_norm + centroid_sq_norm - 2.0 * dot).max(0.0)
}

fn dense(doc: &SparseVec, dims: usize) -> Vec<f64> {
    let mut v = vec![0.0; dims];
    for &(c, w) in doc {
        v[c] = w;
    }
    v
}

/// Index of the nearest centroid; ties go to the lowest index.
fn nearest(doc: &SparseVec, doc_sq_norm: f64, centroids: &[Vec<f64>], norms: &[f64]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, (c, &cn)) in centroids.iter().zip(norms).enumerate() {
        let d = sq_distance(doc, doc_sq_norm, c, cn);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn seed_centroids(corpus: &Corpus, doc_norms: &[f64], k: usize, rng: &mut fastrand::Rng) -> Vec<Vec<f64>> {
    let n = corpus.docs.len();
    let dims = corpus.terms.len();
    let mut centroids = vec![dense(&corpus.docs[rng.usize(..n)], dims)];
    let mut closest: Vec<f64> = vec![f64::INFINITY; n];

    while centroids.len() < k {
        let Some(last) = centroids.last() else { break };
        let last_norm = sq_norm(last);
        for (i, doc) in corpus.docs.iter().enumerate() {
            closest[i] = closest[i].min(sq_distance(doc, doc_norms[i], last, last_norm));
        }
        let total: f64 = closest.iter().sum();
        let pick = if total > 0.0 {
            let target = rng.f64() * total;
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, d) in closest.iter().enumerate() {
                acc += d;
                if acc > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.usize(..n)
        };
        centroids.push(dense(&corpus.docs[pick], dims));
    }
    centroids
}

/// Assign every document to a cluster index in `0..k`.
fn kmeans(corpus: &Corpus, k: usize, config: &TopicConfig) -> Vec<usize> {
    let n = corpus.docs.len();
    let dims = corpus.terms.len();
    let doc_norms: Vec<f64> = corpus
        .docs
        .iter()
        .map(|d| d.iter().map(|(_, w)| w * w).sum())
        .collect();

    let mut rng = fastrand::Rng::with_seed(config.seed);
    let mut centroids = seed_centroids(corpus, &doc_norms, k, &mut rng);
    let mut assignment: Vec<usize> = vec![usize::MAX; n];

    for iteration in 0..config.max_iterations {
        let norms: Vec<f64> = centroids.iter().map(|c| sq_norm(c)).collect();
        let mut changed = false;
        for (i, doc) in corpus.docs.iter().enumerate() {
            let best = nearest(doc, doc_norms[i], &centroids, &norms);
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }
        if !changed {
            tracing::trace!(iteration, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut sizes = vec![0usize; k];
        for (doc, &cluster) in corpus.docs.iter().zip(&assignment) {
            sizes[cluster] += 1;
            for &(c, w) in doc {
                sums[cluster][c] += w;
            }
        }
        for (cluster, (sum, size)) in sums.into_iter().zip(sizes).enumerate() {
            // An empty cluster keeps its previous centroid
            if size > 0 {
                centroids[cluster] = sum.into_iter().map(|x| x / size as f64).collect();
            }
        }
    }
    assignment
}

/// Top centroid terms, heaviest first, ties alphabetical.
fn label(corpus: &Corpus, members: &[usize], terms: usize) -> Option<String> {
    let mut weights: BTreeMap<usize, f64> = BTreeMap::new();
    for &m in members {
        for &(c, w) in &corpus.docs[m] {
            *weights.entry(c).or_default() += w;
        }
    }
    let mut ranked: Vec<(usize, f64)> = weights.into_iter().filter(|(_, w)| *w > 0.0).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top: Vec<&str> = ranked
        .iter()
        .take(terms)
        .map(|&(c, _)| corpus.terms[c].as_str())
        .collect();
    (!top.is_empty()).then(|| top.join(", "))
}

/// Partition `refs` into topic clusters.
///
/// Empty clusters are dropped; ids are assigned in order of each cluster's
/// smallest member id.
pub fn topic_clusters(refs: &[EnrichedReference], config: &TopicConfig) -> Vec<Cluster> {
    if refs.is_empty() {
        return Vec::new();
    }
    let texts: Vec<String> = refs
        .iter()
        .map(|r| {
            let abstract_text = r.abstract_text.as_ref().map(|a| a.value.as_str()).unwrap_or("");
            format!("{} {}", r.title_str(), abstract_text)
        })
        .collect();
    let corpus = vectorize(&texts);
    let k = config.k.clamp(1, refs.len());
    let assignment = if k == 1 {
        vec![0; refs.len()]
    } else {
        kmeans(&corpus, k, config)
    };

    let mut by_cluster: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &cluster) in assignment.iter().enumerate() {
        by_cluster.entry(cluster).or_default().push(i);
    }
    let mut groups: Vec<Vec<usize>> = by_cluster.into_values().collect();
    groups.sort_by_key(|g| g.iter().map(|&i| refs[i].id).min());

    groups
        .into_iter()
        .enumerate()
        .map(|(id, group)| {
            let mut members: Vec<RefId> = group.iter().map(|&i| refs[i].id).collect();
            members.sort_unstable();
            Cluster {
                id,
                kind: ClusterKind::Topic,
                label: label(&corpus, &group, config.label_terms),
                members,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSource, Sourced, VenueKind};

    fn reference(id: RefId, title: &str) -> EnrichedReference {
        EnrichedReference {
            id,
            source_file: String::new(),
            title: Some(Sourced::new(title.into(), FieldSource::Raw)),
            authors: Sourced::new(vec![], FieldSource::Raw),
            year: None,
            venue: None,
            venue_kind: Sourced::new(VenueKind::Unknown, FieldSource::Raw),
            doi: None,
            abstract_text: None,
            oa_url: None,
            citation_count: None,
            retraction: None,
            affiliations: Sourced::new(vec![], FieldSource::Raw),
            topics: vec![],
            flags: Default::default(),
        }
    }

    #[test]
    fn tokenizer_drops_stopwords_numbers_and_short_tokens() {
        assert_eq!(
            tokenize("The Effects of X on 2023 Protein-Folding in a Cell"),
            vec!["effects", "protein", "folding", "cell"]
        );
    }

    #[test]
    fn tfidf_rows_are_unit_length() {
        let corpus = vectorize(&[
            "graph neural networks".to_string(),
            "neural protein models".to_string(),
        ]);
        for doc in &corpus.docs {
            let norm: f64 = doc.iter().map(|(_, w)| w * w).sum();
            assert!((norm - 1.0).abs() < 1e-9);
        }
        // "neural" appears in both documents, so it weighs less than "graph"
        let col = |t: &str| corpus.terms.iter().position(|x| x == t).unwrap();
        let first: BTreeMap<usize, f64> = corpus.docs[0].iter().copied().collect();
        assert!(first[&col("neural")] < first[&col("graph")]);
    }

    #[test]
    fn separates_distinct_topics() {
        let mut refs = Vec::new();
        for i in 0..5 {
            refs.push(reference(i, "Protein folding dynamics"));
        }
        for i in 5..10 {
            refs.push(reference(i, "Galaxy formation cosmology"));
        }
        let config = TopicConfig {
            k: 2,
            ..TopicConfig::default()
        };
        let clusters = topic_clusters(&refs, &config);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1, 2, 3, 4]);
        assert_eq!(clusters[1].members, vec![5, 6, 7, 8, 9]);
        assert_eq!(
            clusters[0].label.as_deref(),
            Some("dynamics, folding, protein")
        );
    }

    #[test]
    fn k_is_capped_by_batch_size() {
        let refs = vec![reference(0, "Widgets"), reference(1, "Gadgets")];
        let clusters = topic_clusters(&refs, &TopicConfig::default());
        assert!(clusters.len() <= 2);
        let total: usize = clusters.iter().map(|c| c.members.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn references_without_text_are_still_assigned() {
        let refs = vec![
            reference(0, ""),
            reference(1, "Quantum error correction"),
            reference(2, "the of and"),
        ];
        let clusters = topic_clusters(&refs, &TopicConfig::default());
        let mut members: Vec<RefId> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        members.sort_unstable();
        assert_eq!(members, vec![0, 1, 2]);
    }

    #[test]
    fn same_seed_same_clusters() {
        let refs: Vec<_> = (0..30)
            .map(|i| reference(i, &format!("topic{} shared words variant{}", i % 4, i % 7)))
            .collect();
        let config = TopicConfig::default();
        assert_eq!(topic_clusters(&refs, &config), topic_clusters(&refs, &config));
    }

    #[test]
    fn default_k_over_larger_batch_gives_one_membership_each() {
        const SUBJECTS: [&str; 13] = [
            "protein", "galaxy", "compiler", "wetland", "vaccine", "glacier", "blockchain",
            "orchestra", "volcano", "semiconductor", "language", "fishery", "robotics",
        ];
        const ANGLES: [&str; 4] = ["survey", "measurement", "simulation", "policy"];
        let refs: Vec<_> = (0..52)
            .map(|i| {
                let title = format!("{} {} study", SUBJECTS[i % 13], ANGLES[i % 4]);
                reference(i, &title)
            })
            .collect();

        let clusters = topic_clusters(&refs, &TopicConfig::default());
        assert!(!clusters.is_empty());
        assert!(clusters.len() <= 8);
        let mut members: Vec<RefId> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        members.sort_unstable();
        assert_eq!(members, (0..52).collect::<Vec<_>>());
    }

    #[test]
    fn empty_batch() {
        assert!(topic_clusters(&[], &TopicConfig::default()).is_empty());
    }
}
