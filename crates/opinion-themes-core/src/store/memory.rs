//! In-memory [`ClusterStore`] implementation for tests.
//!
//! Tables live behind a `std::sync::RwLock`. A writer stages its changes
//! on a private copy of the tables and swaps them in on commit, so a
//! failed or abandoned run leaves the store untouched. Write failures can
//! be injected to exercise the rollback path.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Cluster, CommitReceipt, NewCluster, Opinion};

use super::{ClusterStore, ClusterWriter};

#[derive(Debug, Clone, Default)]
struct Tables {
    opinions: BTreeMap<i64, Opinion>,
    clusters: BTreeMap<i64, Cluster>,
    next_opinion_id: i64,
    next_cluster_id: i64,
}

impl Tables {
    fn assign(&mut self, opinion_ids: &[i64], cluster_id: i64) -> Result<(), StoreError> {
        // Validate first so a conflicting call changes nothing.
        for id in opinion_ids {
            match self.opinions.get(id) {
                Some(o) if o.cluster_id.is_none() => {}
                _ => return Err(StoreError::Conflict { opinion_id: *id }),
            }
        }
        for id in opinion_ids {
            if let Some(o) = self.opinions.get_mut(id) {
                o.cluster_id = Some(cluster_id);
            }
        }
        Ok(())
    }
}

/// When injected write failures fire.
#[derive(Debug, Clone, Copy, Default)]
struct FailurePlan {
    /// Fail the write call after this many successful writes.
    after_writes: Option<usize>,
    on_commit: bool,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    failure: RwLock<FailurePlan>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_opinion_id: 1,
                next_cluster_id: 1,
                ..Tables::default()
            }),
            failure: RwLock::new(FailurePlan::default()),
        }
    }

    /// Add an unclustered opinion and return its id.
    pub fn insert_opinion(&self, text: &str, agenda_id: Option<i64>, created_at: i64) -> i64 {
        let mut tables = self.write();
        let id = tables.next_opinion_id;
        tables.next_opinion_id += 1;
        tables.opinions.insert(
            id,
            Opinion {
                id,
                text: text.to_string(),
                agenda_id,
                cluster_id: None,
                created_at,
            },
        );
        id
    }

    /// Seed a stored cluster directly, bypassing the writer.
    pub fn insert_cluster(&self, title: &str, centroid: Vec<f32>, created_at: i64) -> i64 {
        let mut tables = self.write();
        let id = tables.next_cluster_id;
        tables.next_cluster_id += 1;
        tables.clusters.insert(
            id,
            Cluster {
                id,
                title: title.to_string(),
                centroid,
                member_count: 0,
                created_at,
            },
        );
        id
    }

    /// Assign an opinion to a seeded cluster, bypassing the writer.
    pub fn insert_member(&self, cluster_id: i64, opinion_id: i64) -> Result<(), StoreError> {
        let mut tables = self.write();
        tables.assign(&[opinion_id], cluster_id)?;
        if let Some(c) = tables.clusters.get_mut(&cluster_id) {
            c.member_count += 1;
        }
        Ok(())
    }

    /// Make the writer fail once `n` write calls have succeeded.
    pub fn fail_writes_after(&self, n: usize) {
        self.failure_mut().after_writes = Some(n);
    }

    /// Make every commit fail.
    pub fn fail_commits(&self) {
        self.failure_mut().on_commit = true;
    }

    pub fn clear_failures(&self) {
        *self.failure_mut() = FailurePlan::default();
    }

    pub fn opinion(&self, id: i64) -> Option<Opinion> {
        self.read().opinions.get(&id).cloned()
    }

    pub fn opinions(&self) -> Vec<Opinion> {
        self.read().opinions.values().cloned().collect()
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.read().clusters.values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure_mut(&self) -> RwLockWriteGuard<'_, FailurePlan> {
        self.failure.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn fetch_unclustered_opinions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Opinion>, StoreError> {
        let mut pending: Vec<Opinion> = self
            .read()
            .opinions
            .values()
            .filter(|o| o.cluster_id.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|o| (o.created_at, o.id));
        pending.truncate(limit.unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn fetch_existing_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        let mut clusters: Vec<Cluster> = self.read().clusters.values().cloned().collect();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(clusters)
    }

    async fn fetch_member_texts(&self, cluster_id: i64) -> Result<Vec<String>, StoreError> {
        let tables = self.read();
        if !tables.clusters.contains_key(&cluster_id) {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        let mut members: Vec<&Opinion> = tables
            .opinions
            .values()
            .filter(|o| o.cluster_id == Some(cluster_id))
            .collect();
        members.sort_by_key(|o| (o.created_at, o.id));
        Ok(members.into_iter().map(|o| o.text.clone()).collect())
    }

    async fn begin(&self) -> Result<Box<dyn ClusterWriter + '_>, StoreError> {
        let failure = *self.failure.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Box::new(InMemoryWriter {
            store: self,
            staged: self.read().clone(),
            receipt: CommitReceipt {
                persisted: true,
                ..CommitReceipt::default()
            },
            writes: 0,
            failure,
        }))
    }
}

struct InMemoryWriter<'a> {
    store: &'a InMemoryStore,
    staged: Tables,
    receipt: CommitReceipt,
    writes: usize,
    failure: FailurePlan,
}

impl InMemoryWriter<'_> {
    fn check_injected(&mut self) -> Result<(), StoreError> {
        if let Some(limit) = self.failure.after_writes {
            if self.writes >= limit {
                return Err(StoreError::Injected(format!(
                    "write #{} rejected",
                    self.writes + 1
                )));
            }
        }
        self.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl<'a> ClusterWriter for InMemoryWriter<'a> {
    async fn create_cluster(&mut self, cluster: &NewCluster) -> Result<Cluster, StoreError> {
        self.check_injected()?;
        let id = self.staged.next_cluster_id;
        self.staged.assign(&cluster.member_ids, id)?;
        self.staged.next_cluster_id += 1;

        let stored = Cluster {
            id,
            title: cluster.title.clone(),
            centroid: cluster.centroid.clone(),
            member_count: cluster.member_ids.len() as i64,
            created_at: cluster.created_at,
        };
        self.staged.clusters.insert(id, stored.clone());
        self.receipt.clusters_created += 1;
        self.receipt.opinions_assigned += cluster.member_ids.len();
        Ok(stored)
    }

    async fn attach_to_cluster(
        &mut self,
        cluster_id: i64,
        new_member_ids: &[i64],
        centroid: &[f32],
        member_count: i64,
    ) -> Result<(), StoreError> {
        self.check_injected()?;
        if !self.staged.clusters.contains_key(&cluster_id) {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        self.staged.assign(new_member_ids, cluster_id)?;
        if let Some(c) = self.staged.clusters.get_mut(&cluster_id) {
            c.centroid = centroid.to_vec();
            c.member_count = member_count;
        }
        self.receipt.clusters_updated += 1;
        self.receipt.opinions_assigned += new_member_ids.len();
        Ok(())
    }

    async fn retitle_cluster(&mut self, cluster_id: i64, title: &str) -> Result<(), StoreError> {
        self.check_injected()?;
        match self.staged.clusters.get_mut(&cluster_id) {
            Some(c) => {
                c.title = title.to_string();
                Ok(())
            }
            None => Err(StoreError::UnknownCluster(cluster_id)),
        }
    }

    async fn commit(self: Box<Self>) -> Result<CommitReceipt, StoreError> {
        if self.failure.on_commit {
            return Err(StoreError::Injected("commit rejected".to_string()));
        }
        let this = *self;
        *this.store.write() = this.staged;
        Ok(this.receipt)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
