//! Core data models shared by the clustering pipeline.
//!
//! [`Opinion`] and [`Cluster`] mirror the rows of the portal's `opinions`
//! and `clusters` tables. Embedding vectors are plain `Vec<f32>` and are
//! only persisted as cluster centroids.

use serde::{Deserialize, Serialize};

/// A citizen-submitted opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    pub id: i64,
    pub text: String,
    /// Owning agenda. Carried through, never interpreted.
    pub agenda_id: Option<i64>,
    /// `None` means the opinion is waiting for the next clustering run.
    pub cluster_id: Option<i64>,
    /// Unix seconds. Primary ordering key for clustering.
    pub created_at: i64,
}

impl Opinion {
    pub fn is_clustered(&self) -> bool {
        self.cluster_id.is_some()
    }
}

/// A stored theme grouping semantically similar opinions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub title: String,
    /// Mean of the member embeddings.
    pub centroid: Vec<f32>,
    pub member_count: i64,
    /// Unix seconds.
    pub created_at: i64,
}

/// A cluster that does not exist in the store yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub title: String,
    pub centroid: Vec<f32>,
    pub member_ids: Vec<i64>,
    /// Unix seconds.
    pub created_at: i64,
}

/// Counts confirmed by the store when a run's writes are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub clusters_created: usize,
    pub clusters_updated: usize,
    pub opinions_assigned: usize,
    /// `false` when the writer discarded everything (test mode).
    pub persisted: bool,
}
