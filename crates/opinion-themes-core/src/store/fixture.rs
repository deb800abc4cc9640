//! Read-only [`ClusterStore`] over a fixed opinion set.
//!
//! Backs `TEST_MODE` runs: the pipeline reads the fixture opinions (and
//! optional fixture clusters), plans as usual, and the writer accepts every
//! operation without storing anything. The receipt carries the counts the
//! run would have written with `persisted = false`.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Cluster, CommitReceipt, NewCluster, Opinion};

use super::{ClusterStore, ClusterWriter};

pub struct FixtureStore {
    opinions: Vec<Opinion>,
    clusters: Vec<Cluster>,
}

impl FixtureStore {
    pub fn new(opinions: Vec<Opinion>) -> Self {
        Self {
            opinions,
            clusters: Vec::new(),
        }
    }

    pub fn with_clusters(mut self, clusters: Vec<Cluster>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn len(&self) -> usize {
        self.opinions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opinions.is_empty()
    }
}

#[async_trait]
impl ClusterStore for FixtureStore {
    async fn fetch_unclustered_opinions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Opinion>, StoreError> {
        let mut pending: Vec<Opinion> = self
            .opinions
            .iter()
            .filter(|o| o.cluster_id.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|o| (o.created_at, o.id));
        pending.truncate(limit.unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn fetch_existing_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        let mut clusters = self.clusters.clone();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(clusters)
    }

    async fn fetch_member_texts(&self, cluster_id: i64) -> Result<Vec<String>, StoreError> {
        if !self.clusters.iter().any(|c| c.id == cluster_id) {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        let mut members: Vec<&Opinion> = self
            .opinions
            .iter()
            .filter(|o| o.cluster_id == Some(cluster_id))
            .collect();
        members.sort_by_key(|o| (o.created_at, o.id));
        Ok(members.into_iter().map(|o| o.text.clone()).collect())
    }

    async fn begin(&self) -> Result<Box<dyn ClusterWriter + '_>, StoreError> {
        let next_id = self.clusters.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        Ok(Box::new(DiscardingWriter {
            store: self,
            assigned: HashSet::new(),
            next_id,
            receipt: CommitReceipt::default(),
        }))
    }
}

/// Accepts writes, validates them against the fixture, keeps nothing.
struct DiscardingWriter<'a> {
    store: &'a FixtureStore,
    assigned: HashSet<i64>,
    next_id: i64,
    receipt: CommitReceipt,
}

impl DiscardingWriter<'_> {
    fn assign(&mut self, opinion_ids: &[i64]) -> Result<(), StoreError> {
        for id in opinion_ids {
            let unclustered = self
                .store
                .opinions
                .iter()
                .any(|o| o.id == *id && o.cluster_id.is_none());
            if !unclustered || self.assigned.contains(id) {
                return Err(StoreError::Conflict { opinion_id: *id });
            }
        }
        self.assigned.extend(opinion_ids.iter().copied());
        Ok(())
    }
}

#[async_trait]
impl<'a> ClusterWriter for DiscardingWriter<'a> {
    async fn create_cluster(&mut self, cluster: &NewCluster) -> Result<Cluster, StoreError> {
        self.assign(&cluster.member_ids)?;
        let id = self.next_id;
        self.next_id += 1;
        self.receipt.clusters_created += 1;
        self.receipt.opinions_assigned += cluster.member_ids.len();
        Ok(Cluster {
            id,
            title: cluster.title.clone(),
            centroid: cluster.centroid.clone(),
            member_count: cluster.member_ids.len() as i64,
            created_at: cluster.created_at,
        })
    }

    async fn attach_to_cluster(
        &mut self,
        cluster_id: i64,
        new_member_ids: &[i64],
        _centroid: &[f32],
        _member_count: i64,
    ) -> Result<(), StoreError> {
        if !self.store.clusters.iter().any(|c| c.id == cluster_id) {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        self.assign(new_member_ids)?;
        self.receipt.clusters_updated += 1;
        self.receipt.opinions_assigned += new_member_ids.len();
        Ok(())
    }

    async fn retitle_cluster(&mut self, cluster_id: i64, _title: &str) -> Result<(), StoreError> {
        if !self.store.clusters.iter().any(|c| c.id == cluster_id) {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitReceipt, StoreError> {
        Ok(self.receipt)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opinion(id: i64, created_at: i64) -> Opinion {
        Opinion {
            id,
            text: format!("text {}", id),
            agenda_id: None,
            cluster_id: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_commit_is_not_persisted() {
        let store = FixtureStore::new(vec![opinion(1, 2), opinion(2, 1)]);
        let mut writer = store.begin().await.unwrap();
        writer
            .create_cluster(&NewCluster {
                title: "t".to_string(),
                centroid: vec![1.0],
                member_ids: vec![1, 2],
                created_at: 0,
            })
            .await
            .unwrap();
        let receipt = writer.commit().await.unwrap();
        assert!(!receipt.persisted);
        assert_eq!(receipt.clusters_created, 1);
        assert_eq!(receipt.opinions_assigned, 2);

        // Nothing changed: the same opinions are still pending, oldest first.
        let pending = store.fetch_unclustered_opinions(None).await.unwrap();
        assert_eq!(pending.iter().map(|o| o.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_rejects_unknown_opinion() {
        let store = FixtureStore::new(vec![opinion(1, 1)]);
        let mut writer = store.begin().await.unwrap();
        let err = writer
            .create_cluster(&NewCluster {
                title: "t".to_string(),
                centroid: vec![1.0],
                member_ids: vec![99],
                created_at: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict { opinion_id: 99 });
    }
}
