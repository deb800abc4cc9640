//! Incremental, greedy opinion clustering.
//!
//! The [`SimilarityEngine`] takes opinions one at a time (oldest first) and
//! either attaches each to the most similar cluster or seeds a new one:
//!
//! ```text
//!   opinion ──▶ cosine vs. every centroid ──▶ max ≥ τ ? ──yes──▶ join, recompute centroid
//!                (existing + seeded this run)        │
//!                                                    └──no───▶ seed singleton cluster
//! ```
//!
//! # Determinism
//!
//! Given the same opinions, embeddings, existing centroids, and τ, the
//! resulting [`ClusterPlan`] is identical:
//!
//! - opinions are visited in ascending `(created_at, id)`;
//! - ties at the maximum similarity go to the lowest cluster id, then the
//!   earliest `created_at`; clusters seeded during the run rank after all
//!   stored clusters, in seed order;
//! - centroids are recomputed from the persisted base plus every retained
//!   in-run member embedding, never drifted incrementally.

use crate::embedding::{cosine_similarity, mean_vector};
use crate::error::ConfigurationError;
use crate::models::{Cluster, Opinion};

/// Identity of a cluster during planning.
///
/// Derived `Ord` puts every stored cluster before every seed, which is the
/// order they will hold once seeds are inserted with fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterKey {
    Existing(i64),
    Seed(usize),
}

/// Outcome of placing a single opinion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assignment {
    Joined { key: ClusterKey, similarity: f32 },
    Seeded { key: ClusterKey },
}

impl Assignment {
    pub fn key(&self) -> ClusterKey {
        match self {
            Assignment::Joined { key, .. } | Assignment::Seeded { key } => *key,
        }
    }
}

/// An opinion placed into a cluster by this run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMember {
    pub opinion_id: i64,
    pub text: String,
}

/// New members for a cluster that already exists in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAttachment {
    pub cluster_id: i64,
    pub title: String,
    pub members: Vec<PlannedMember>,
    pub centroid: Vec<f32>,
    pub member_count: i64,
}

/// A cluster born in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSeed {
    pub members: Vec<PlannedMember>,
    pub centroid: Vec<f32>,
    /// `created_at` of the seeding opinion.
    pub created_at: i64,
}

/// Everything a run intends to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterPlan {
    pub attachments: Vec<PlannedAttachment>,
    pub seeds: Vec<PlannedSeed>,
}

impl ClusterPlan {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.seeds.is_empty()
    }

    /// Opinions attached to stored clusters.
    pub fn attached_count(&self) -> usize {
        self.attachments.iter().map(|a| a.members.len()).sum()
    }

    /// Opinions placed in newly seeded clusters.
    pub fn seeded_count(&self) -> usize {
        self.seeds.iter().map(|s| s.members.len()).sum()
    }

    pub fn assigned_count(&self) -> usize {
        self.attached_count() + self.seeded_count()
    }
}

struct WorkingCluster {
    key: ClusterKey,
    title: String,
    created_at: i64,
    /// Persisted centroid and the member count it stands for.
    base: Option<(Vec<f32>, i64)>,
    members: Vec<PlannedMember>,
    embeddings: Vec<Vec<f32>>,
    centroid: Vec<f32>,
}

impl WorkingCluster {
    fn member_count(&self) -> i64 {
        self.base.as_ref().map(|(_, n)| *n).unwrap_or(0) + self.members.len() as i64
    }

    fn recompute_centroid(&mut self, dims: usize) {
        let members: Vec<&[f32]> = self.embeddings.iter().map(Vec::as_slice).collect();
        let base = self.base.as_ref().map(|(c, n)| (c.as_slice(), *n));
        self.centroid = mean_vector(dims, base, &members);
    }
}

/// Greedy single-pass cluster assignment.
pub struct SimilarityEngine {
    threshold: f32,
    dims: usize,
    clusters: Vec<WorkingCluster>,
    seeds: usize,
}

impl SimilarityEngine {
    /// Create an engine for `dims`-dimensional vectors.
    ///
    /// # Errors
    ///
    /// `threshold` must be a finite value in `[-1.0, 1.0]` and `dims` > 0.
    pub fn new(threshold: f32, dims: usize) -> Result<Self, ConfigurationError> {
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            return Err(ConfigurationError::Invalid(format!(
                "similarity threshold must be in [-1.0, 1.0], got {}",
                threshold
            )));
        }
        if dims == 0 {
            return Err(ConfigurationError::Invalid(
                "embedding dimensionality must be > 0".to_string(),
            ));
        }
        Ok(Self {
            threshold,
            dims,
            clusters: Vec::new(),
            seeds: 0,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Load stored clusters as join candidates.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::DimensionMismatch`] if any centroid has the
    /// wrong length, [`ConfigurationError::Invalid`] if one holds a NaN or
    /// infinite component.
    pub fn with_existing(mut self, existing: &[Cluster]) -> Result<Self, ConfigurationError> {
        for cluster in existing {
            self.check_vector(&cluster.centroid, || {
                format!("centroid of cluster {}", cluster.id)
            })?;
            self.clusters.push(WorkingCluster {
                key: ClusterKey::Existing(cluster.id),
                title: cluster.title.clone(),
                created_at: cluster.created_at,
                base: Some((cluster.centroid.clone(), cluster.member_count.max(0))),
                members: Vec::new(),
                embeddings: Vec::new(),
                centroid: cluster.centroid.clone(),
            });
        }
        // Candidate order doubles as the tie-break order.
        self.clusters.sort_by_key(|c| (c.key, c.created_at));
        Ok(self)
    }

    /// Place one opinion.
    ///
    /// Callers must feed opinions in ascending `(created_at, id)`;
    /// [`plan_clusters`] does the sorting.
    pub fn assign(
        &mut self,
        opinion: &Opinion,
        embedding: Vec<f32>,
    ) -> Result<Assignment, ConfigurationError> {
        self.check_vector(&embedding, || format!("embedding of opinion {}", opinion.id))?;

        let mut best: Option<(usize, f32)> = None;
        for (idx, cluster) in self.clusters.iter().enumerate() {
            let sim = cosine_similarity(&embedding, &cluster.centroid);
            if sim.is_nan() {
                continue;
            }
            // Strictly greater: the earlier candidate keeps a tie.
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((idx, sim));
            }
        }

        let member = PlannedMember {
            opinion_id: opinion.id,
            text: opinion.text.clone(),
        };

        match best {
            Some((idx, sim)) if sim >= self.threshold => {
                let dims = self.dims;
                let cluster = &mut self.clusters[idx];
                cluster.members.push(member);
                cluster.embeddings.push(embedding);
                cluster.recompute_centroid(dims);
                Ok(Assignment::Joined {
                    key: cluster.key,
                    similarity: sim,
                })
            }
            _ => {
                let key = ClusterKey::Seed(self.seeds);
                self.seeds += 1;
                self.clusters.push(WorkingCluster {
                    key,
                    title: String::new(),
                    created_at: opinion.created_at,
                    base: None,
                    members: vec![member],
                    centroid: embedding.clone(),
                    embeddings: vec![embedding],
                });
                Ok(Assignment::Seeded { key })
            }
        }
    }

    /// Current centroid of a cluster, if known.
    pub fn centroid(&self, key: ClusterKey) -> Option<&[f32]> {
        self.clusters
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.centroid.as_slice())
    }

    /// Finish the run: stored clusters that gained members become
    /// attachments, seeds keep their creation order.
    pub fn into_plan(self) -> ClusterPlan {
        let mut plan = ClusterPlan::default();
        for cluster in self.clusters {
            if cluster.members.is_empty() {
                continue;
            }
            let member_count = cluster.member_count();
            match cluster.key {
                ClusterKey::Existing(cluster_id) => plan.attachments.push(PlannedAttachment {
                    cluster_id,
                    title: cluster.title,
                    members: cluster.members,
                    centroid: cluster.centroid,
                    member_count,
                }),
                ClusterKey::Seed(_) => plan.seeds.push(PlannedSeed {
                    members: cluster.members,
                    centroid: cluster.centroid,
                    created_at: cluster.created_at,
                }),
            }
        }
        plan
    }

    /// Place a batch oldest first and return the plan.
    pub fn plan(
        mut self,
        mut embedded: Vec<(Opinion, Vec<f32>)>,
    ) -> Result<ClusterPlan, ConfigurationError> {
        embedded.sort_by_key(|(o, _)| (o.created_at, o.id));
        for (opinion, embedding) in embedded {
            self.assign(&opinion, embedding)?;
        }
        Ok(self.into_plan())
    }

    fn check_vector(
        &self,
        vector: &[f32],
        context: impl FnOnce() -> String,
    ) -> Result<(), ConfigurationError> {
        if vector.len() != self.dims {
            return Err(ConfigurationError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
                context: context(),
            });
        }
        if !vector.iter().all(|x| x.is_finite()) {
            return Err(ConfigurationError::Invalid(format!(
                "{} has a non-finite component",
                context()
            )));
        }
        Ok(())
    }
}

/// Plan a whole batch: sort opinions oldest first, then assign each.
pub fn plan_clusters(
    threshold: f32,
    dims: usize,
    existing: &[Cluster],
    embedded: Vec<(Opinion, Vec<f32>)>,
) -> Result<ClusterPlan, ConfigurationError> {
    SimilarityEngine::new(threshold, dims)?
        .with_existing(existing)?
        .plan(embedded)
}
