//! Schema migrations.
//!
//! Creates the tables the clustering pipeline reads and writes. The portal
//! owns `agendas` and `opinions`; they are created here only so a fresh
//! database (local development, CI) has the shape the pipeline expects.
//! Every statement is idempotent.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema on an existing pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agendas (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            centroid BLOB NOT NULL,
            dims INTEGER NOT NULL,
            member_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS opinions (
            id INTEGER PRIMARY KEY,
            agenda_id INTEGER REFERENCES agendas(id),
            text TEXT NOT NULL,
            cluster_id INTEGER REFERENCES clusters(id),
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_opinions_cluster_created ON opinions(cluster_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_clusters_created_at ON clusters(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
