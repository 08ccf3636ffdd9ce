//! Cluster engine: three independent partitions of a batch.
//!
//! - author communities (shared normalized author names)
//! - organization communities (shared normalized affiliation strings)
//! - topic clusters (TF-IDF + seeded k-means over title and abstract)
//!
//! Every reference lands in exactly one cluster of each kind.

pub mod community;
pub mod topic;

use std::collections::BTreeMap;

pub use topic::TopicConfig;

use crate::CoreError;
use crate::model::{Cluster, ClusterKind, EnrichedReference, RefId};

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Shared names needed before two references are linked.
    pub min_edge_weight: usize,
    pub topic: TopicConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_edge_weight: 1,
            topic: TopicConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_edge_weight == 0 {
            return Err(CoreError::Configuration(
                "min_edge_weight must be >= 1".into(),
            ));
        }
        self.topic.validate()
    }
}

/// The three partitions of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clustering {
    pub author: Vec<Cluster>,
    pub organization: Vec<Cluster>,
    pub topic: Vec<Cluster>,
}

impl Clustering {
    pub fn of_kind(&self, kind: ClusterKind) -> &[Cluster] {
        match kind {
            ClusterKind::Author => &self.author,
            ClusterKind::Organization => &self.organization,
            ClusterKind::Topic => &self.topic,
        }
    }

    /// Reference id to cluster id, for one kind.
    pub fn assignment(&self, kind: ClusterKind) -> BTreeMap<RefId, usize> {
        self.of_kind(kind)
            .iter()
            .flat_map(|c| c.members.iter().map(move |&m| (m, c.id)))
            .collect()
    }

    /// Every cluster, grouped by kind.
    pub fn into_vec(self) -> Vec<Cluster> {
        let mut all = self.author;
        all.extend(self.organization);
        all.extend(self.topic);
        all
    }
}

/// Build all three partitions.
pub fn cluster_all(refs: &[EnrichedReference], config: &ClusterConfig) -> Clustering {
    let clustering = Clustering {
        author: community::community_clusters(refs, ClusterKind::Author, config.min_edge_weight),
        organization: community::community_clusters(
            refs,
            ClusterKind::Organization,
            config.min_edge_weight,
        ),
        topic: topic::topic_clusters(refs, &config.topic),
    };
    tracing::debug!(
        authors = clustering.author.len(),
        organizations = clustering.organization.len(),
        topics = clustering.topic.len(),
        "clustering complete"
    );
    clustering
}
