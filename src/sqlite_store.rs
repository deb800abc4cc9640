//! SQLite-backed [`ClusterStore`] implementation.
//!
//! Reads go straight to the pool. [`ClusterStore::begin`] opens one
//! database transaction for the whole run; each writer call runs inside a
//! savepoint so it is atomic on its own, and nothing is visible to other
//! connections until the run commits.

use async_trait::async_trait;
use sqlx::sqlite::Sqlite;
use sqlx::{Connection, Row, SqlitePool, Transaction};

use opinion_themes_core::embedding::{blob_to_vec, vec_to_blob};
use opinion_themes_core::error::StoreError;
use opinion_themes_core::models::{Cluster, CommitReceipt, NewCluster, Opinion};
use opinion_themes_core::store::{ClusterStore, ClusterWriter};

/// SQLite implementation of the [`ClusterStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn fetch_unclustered_opinions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Opinion>, StoreError> {
        // LIMIT -1 means no limit in SQLite.
        let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT id, agenda_id, text, cluster_id, created_at
            FROM opinions
            WHERE cluster_id IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit_val)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| Opinion {
                id: row.get("id"),
                text: row.get("text"),
                agenda_id: row.get("agenda_id"),
                cluster_id: row.get("cluster_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn fetch_existing_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, centroid, member_count, created_at
            FROM clusters
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("centroid");
                Cluster {
                    id: row.get("id"),
                    title: row.get("title"),
                    centroid: blob_to_vec(&blob),
                    member_count: row.get("member_count"),
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }

    async fn fetch_member_texts(&self, cluster_id: i64) -> Result<Vec<String>, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM clusters WHERE id = ?")
            .bind(cluster_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        if !exists {
            return Err(StoreError::UnknownCluster(cluster_id));
        }

        sqlx::query_scalar(
            "SELECT text FROM opinions WHERE cluster_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn begin(&self) -> Result<Box<dyn ClusterWriter + '_>, StoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(SqliteWriter {
            tx,
            receipt: CommitReceipt {
                persisted: true,
                ..CommitReceipt::default()
            },
        }))
    }
}

/// Run-wide transaction over the pool.
struct SqliteWriter {
    tx: Transaction<'static, Sqlite>,
    receipt: CommitReceipt,
}

/// Assign opinions that are still unclustered; anything else is a conflict.
async fn assign_opinions(
    conn: &mut sqlx::SqliteConnection,
    cluster_id: i64,
    opinion_ids: &[i64],
) -> Result<(), StoreError> {
    for &opinion_id in opinion_ids {
        let result =
            sqlx::query("UPDATE opinions SET cluster_id = ? WHERE id = ? AND cluster_id IS NULL")
                .bind(cluster_id)
                .bind(opinion_id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { opinion_id });
        }
    }
    Ok(())
}

#[async_trait]
impl ClusterWriter for SqliteWriter {
    async fn create_cluster(&mut self, cluster: &NewCluster) -> Result<Cluster, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut sp = Connection::begin(&mut *self.tx).await.map_err(db_err)?;

        let id = sqlx::query(
            r#"
            INSERT INTO clusters (title, centroid, dims, member_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster.title)
        .bind(vec_to_blob(&cluster.centroid))
        .bind(cluster.centroid.len() as i64)
        .bind(cluster.member_ids.len() as i64)
        .bind(cluster.created_at)
        .bind(now)
        .execute(&mut *sp)
        .await
        .map_err(db_err)?
        .last_insert_rowid();

        if let Err(e) = assign_opinions(&mut sp, id, &cluster.member_ids).await {
            sp.rollback().await.map_err(db_err)?;
            return Err(e);
        }
        sp.commit().await.map_err(db_err)?;

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
        centroid: &[f32],
        member_count: i64,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut sp = Connection::begin(&mut *self.tx).await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE clusters
            SET centroid = ?, dims = ?, member_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(vec_to_blob(centroid))
        .bind(centroid.len() as i64)
        .bind(member_count)
        .bind(now)
        .bind(cluster_id)
        .execute(&mut *sp)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::UnknownCluster(cluster_id));
        }

        if let Err(e) = assign_opinions(&mut sp, cluster_id, new_member_ids).await {
            sp.rollback().await.map_err(db_err)?;
            return Err(e);
        }
        sp.commit().await.map_err(db_err)?;

        self.receipt.clusters_updated += 1;
        self.receipt.opinions_assigned += new_member_ids.len();
        Ok(())
    }

    async fn retitle_cluster(&mut self, cluster_id: i64, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE clusters SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(chrono::Utc::now().timestamp())
            .bind(cluster_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownCluster(cluster_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<CommitReceipt, StoreError> {
        let this = *self;
        this.tx.commit().await.map_err(db_err)?;
        Ok(this.receipt)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(db_err)
    }
}
