//! Run summaries and the cluster listing.
//!
//! The run summary has the same shape in live and test mode. A committed
//! live run adds a `persisted` block with the row counts the store
//! confirmed; a test-mode run prints its plan instead, since nothing was
//! written. Used by `themes run` and `themes clusters`.

use anyhow::Result;

use opinion_themes_core::store::ClusterStore;

use crate::config::Config;
use crate::db;
use crate::pipeline::{RunReport, TitleSource};
use crate::sqlite_store::SqliteStore;

/// Render the human summary of a run.
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("cluster opinions\n");
    out.push_str(&format!("  run: {}\n", report.run_id));
    out.push_str(&format!("  opinions processed: {}\n", report.processed));
    out.push_str(&format!("  new clusters: {}\n", report.new_themes.len()));
    for theme in &report.new_themes {
        let marker = match theme.title_source {
            TitleSource::Provider => "",
            TitleSource::Fallback => " (fallback title)",
        };
        out.push_str(&format!(
            "    - \"{}\"{}: {} opinion{}\n",
            theme.title,
            marker,
            theme.member_ids.len(),
            plural(theme.member_ids.len())
        ));
    }
    out.push_str(&format!(
        "  attached to existing clusters: {}\n",
        report.attached_count()
    ));
    for grown in &report.grown_themes {
        out.push_str(&format!(
            "    - #{} \"{}\": +{} (now {})",
            grown.cluster_id,
            grown.title,
            grown.added_ids.len(),
            grown.member_count
        ));
        if let Some(title) = &grown.new_title {
            out.push_str(&format!(", retitled \"{}\"", title));
        }
        out.push('\n');
    }
    out.push_str(&format!("  skipped: {}\n", report.skipped.len()));
    out.push_str(&format!("  errors: {}\n", report.issues.len()));
    if let Some(first) = report.first_error() {
        out.push_str(&format!("  first error: {}\n", first));
    }

    match report.receipt {
        Some(receipt) if receipt.persisted => {
            out.push_str("persisted\n");
            out.push_str(&format!("  clusters created: {}\n", receipt.clusters_created));
            out.push_str(&format!("  clusters updated: {}\n", receipt.clusters_updated));
            out.push_str(&format!("  opinions assigned: {}\n", receipt.opinions_assigned));
        }
        Some(_) => {
            out.push_str("not persisted (test mode)\n");
            for theme in &report.new_themes {
                let id = theme
                    .cluster_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string());
                out.push_str(&format!(
                    "  create #{} \"{}\" <- opinions [{}]\n",
                    id,
                    theme.title,
                    join_ids(&theme.member_ids)
                ));
            }
            for grown in &report.grown_themes {
                out.push_str(&format!(
                    "  attach #{} <- opinions [{}]\n",
                    grown.cluster_id,
                    join_ids(&grown.added_ids)
                ));
            }
        }
        None => {}
    }

    match &report.failure {
        None if report.is_success() => out.push_str("ok\n"),
        Some(failure) => out.push_str(&format!("failed during {}\n", failure.stage)),
        None => out.push_str("failed\n"),
    }
    out
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// List stored clusters, newest first.
pub async fn run_list_clusters(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let clusters = store.fetch_existing_clusters().await?;
    let unclustered: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM opinions WHERE cluster_id IS NULL")
            .fetch_one(&pool)
            .await?;

    println!("Opinion Themes — Clusters");
    println!("=========================");
    println!();
    println!("  Clusters:     {}", clusters.len());
    println!("  Unclustered:  {}", unclustered);

    if !clusters.is_empty() {
        println!();
        println!(
            "  {:>6}  {:<42} {:>8}   {}",
            "ID", "TITLE", "MEMBERS", "CREATED"
        );
        println!("  {}", "-".repeat(76));
        for c in &clusters {
            println!(
                "  {:>6}  {:<42} {:>8}   {}",
                c.id,
                c.title,
                c.member_count,
                format_ts_iso(c.created_at)
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
