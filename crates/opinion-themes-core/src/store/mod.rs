//! Storage contract for the clustering pipeline.
//!
//! The [`ClusterStore`] trait covers the reads a run needs and hands out a
//! [`ClusterWriter`] that owns the run's transaction. Every write of a
//! run goes through one writer and becomes visible only on
//! [`commit`](ClusterWriter::commit); dropping or rolling back the writer
//! discards all of it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Adapter | Use |
//! |---------|-----|
//! | `SqliteStore` (app crate) | live runs |
//! | [`memory::InMemoryStore`] | tests, with write-failure injection |
//! | [`fixture::FixtureStore`] | `TEST_MODE`: fixed opinions, writes discarded |

pub mod fixture;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Cluster, CommitReceipt, NewCluster, Opinion};

/// Read side of the store plus the transaction entry point.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`fetch_unclustered_opinions`](ClusterStore::fetch_unclustered_opinions) | opinions with no cluster, oldest first |
/// | [`fetch_existing_clusters`](ClusterStore::fetch_existing_clusters) | all clusters, newest first |
/// | [`fetch_member_texts`](ClusterStore::fetch_member_texts) | texts of a cluster's stored members, oldest first |
/// | [`begin`](ClusterStore::begin) | open the run-wide writer |
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Opinions whose `cluster_id` is null, ordered by `created_at` then
    /// `id`, ascending. `limit` caps the batch size.
    async fn fetch_unclustered_opinions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Opinion>, StoreError>;

    /// Every cluster with its centroid, most recent first.
    ///
    /// The order is for reporting only; clustering re-sorts by id.
    async fn fetch_existing_clusters(&self) -> Result<Vec<Cluster>, StoreError>;

    /// Texts of the opinions currently assigned to `cluster_id`.
    async fn fetch_member_texts(&self, cluster_id: i64) -> Result<Vec<String>, StoreError>;

    /// Open a writer for this run's changes.
    async fn begin(&self) -> Result<Box<dyn ClusterWriter + '_>, StoreError>;
}

/// Transaction-scoped writes for one run.
///
/// Each call is atomic on its own, and nothing is observable by readers
/// until [`commit`](ClusterWriter::commit) returns.
#[async_trait]
pub trait ClusterWriter: Send {
    /// Insert a cluster row and assign its initial members.
    ///
    /// Fails with [`StoreError::Conflict`] if a member is missing or
    /// already clustered.
    async fn create_cluster(&mut self, cluster: &NewCluster) -> Result<Cluster, StoreError>;

    /// Replace a cluster's centroid and member count, and assign the new
    /// members.
    async fn attach_to_cluster(
        &mut self,
        cluster_id: i64,
        new_member_ids: &[i64],
        centroid: &[f32],
        member_count: i64,
    ) -> Result<(), StoreError>;

    /// Overwrite a cluster's title.
    async fn retitle_cluster(&mut self, cluster_id: i64, title: &str) -> Result<(), StoreError>;

    /// Make every write of this writer visible.
    async fn commit(self: Box<Self>) -> Result<CommitReceipt, StoreError>;

    /// Discard every write of this writer.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
