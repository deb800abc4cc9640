//! `themes run`: wire configuration, store, and provider into a pipeline run.

use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::info;

use opinion_themes_core::store::fixture::FixtureStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::fixtures;
use crate::pipeline::{Pipeline, PipelineOptions, RunReport};
use crate::report;
use crate::sqlite_store::SqliteStore;

/// Flags of `themes run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub test_mode: bool,
    pub fixture: Option<PathBuf>,
    pub limit: Option<usize>,
    pub threshold: Option<f32>,
}

/// Apply CLI overrides on top of the file configuration.
pub fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(t) = args.threshold {
        config.clustering.threshold = Some(t);
    }
    if let Some(limit) = args.limit {
        config.clustering.batch_limit = Some(limit);
    }
}

/// Run one clustering pass and print its summary.
///
/// Configuration problems are returned as errors before any work starts.
/// Everything after that is described by the returned report.
pub async fn run_cluster(config: &Config, args: &RunArgs) -> Result<RunReport> {
    if args.fixture.is_some() && !args.test_mode {
        bail!("--fixture only applies to test mode (--test-mode or TEST_MODE)");
    }
    let mut config = config.clone();
    apply_overrides(&mut config, args);
    config.validate(args.test_mode)?;

    let client = embedding::create_client(&config.embedding)?;
    let options = PipelineOptions::from_config(&config)?;
    info!(
        test_mode = args.test_mode,
        provider = %config.embedding.provider,
        model = client.model_name(),
        threshold = options.threshold,
        "starting clustering run"
    );

    let report = if args.test_mode {
        let fixture = match &args.fixture {
            Some(path) => fixtures::load_fixture(path)?,
            None => fixtures::builtin_fixture(),
        };
        let store = FixtureStore::new(fixture.opinions).with_clusters(fixture.clusters);
        Pipeline::new(&store, client.as_ref(), options).run().await
    } else {
        let pool = db::connect(&config).await?;
        let store = SqliteStore::new(pool);
        let report = Pipeline::new(&store, client.as_ref(), options).run().await;
        store.pool().close().await;
        report
    };

    print!("{}", report::format_report(&report));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let mut cfg = Config::test_mode_defaults();
        apply_overrides(
            &mut cfg,
            &RunArgs {
                threshold: Some(0.5),
                limit: Some(3),
                ..RunArgs::default()
            },
        );
        assert_eq!(cfg.clustering.threshold, Some(0.5));
        assert_eq!(cfg.clustering.batch_limit, Some(3));
    }

    #[tokio::test]
    async fn test_builtin_test_mode_run_succeeds() {
        let args = RunArgs {
            test_mode: true,
            ..RunArgs::default()
        };
        let report = run_cluster(&Config::test_mode_defaults(), &args)
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(!report.persisted());
        assert_eq!(report.processed, 12);
        let assigned: usize = report.new_themes.iter().map(|t| t.member_ids.len()).sum();
        assert_eq!(assigned, 12);
    }

    #[tokio::test]
    async fn test_out_of_range_threshold_override_fails_before_run() {
        let args = RunArgs {
            test_mode: true,
            threshold: Some(1.5),
            ..RunArgs::default()
        };
        let err = run_cluster(&Config::test_mode_defaults(), &args)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("clustering.threshold"));
    }

    #[tokio::test]
    async fn test_live_run_requires_db() {
        let err = run_cluster(&Config::test_mode_defaults(), &RunArgs::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("[db].url"));
    }
}
