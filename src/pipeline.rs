//! The clustering run.
//!
//! One run walks a fixed sequence of states:
//!
//! ```text
//! Loading ──▶ Embedding ──▶ Clustering ──▶ Titling ──▶ Committing ──▶ Done
//!    │            │              │            │             │
//!    └────────────┴──────────────┴────────────┴─────────────┴──────▶ Failed
//! ```
//!
//! # Failure Policy
//!
//! - Provider failures are retried with backoff (see [`crate::retry`]).
//!   An opinion whose embedding still fails is skipped and stays
//!   unclustered for the next run; a title that still fails becomes the
//!   deterministic fallback title.
//! - Configuration errors (including a vector of the wrong size) fail the
//!   run before anything is written.
//! - Any store error fails the run and rolls back every write it made.
//!
//! The pipeline only sees the [`ClusterStore`] and [`EmbeddingClient`]
//! traits; test mode passes a fixture store instead of the SQLite one.

use std::fmt;

use opinion_themes_core::embedding::EmbeddingClient;
use opinion_themes_core::error::{ConfigurationError, PipelineError, ProviderError, StoreError};
use opinion_themes_core::models::{CommitReceipt, NewCluster, Opinion};
use opinion_themes_core::similarity::{ClusterPlan, SimilarityEngine};
use opinion_themes_core::store::{ClusterStore, ClusterWriter};
use opinion_themes_core::title::{fallback_title, normalize_title, sample_texts};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::retry::{with_retry, RetryPolicy};

/// Where a run is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Loading,
    Embedding,
    Clustering,
    Titling,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Loading => "loading",
            RunState::Embedding => "embedding",
            RunState::Clustering => "clustering",
            RunState::Titling => "titling",
            RunState::Committing => "committing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Run parameters resolved from configuration and CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub threshold: f32,
    pub title_sample_size: usize,
    pub retitle_on_attach: bool,
    pub batch_limit: Option<usize>,
    pub retry: RetryPolicy,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        Ok(Self {
            threshold: config.threshold()?,
            title_sample_size: config.clustering.title_sample_size,
            retitle_on_attach: config.clustering.retitle_on_attach,
            batch_limit: config.clustering.batch_limit,
            retry: RetryPolicy::from_config(&config.embedding),
        })
    }
}

/// How a title was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleSource {
    Provider,
    Fallback,
}

/// A cluster created by the run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTheme {
    /// Store id, once committed (provisional in test mode).
    pub cluster_id: Option<i64>,
    pub title: String,
    pub title_source: TitleSource,
    pub member_ids: Vec<i64>,
}

/// A stored cluster that gained members.
#[derive(Debug, Clone, PartialEq)]
pub struct GrownTheme {
    pub cluster_id: i64,
    pub title: String,
    /// Set when the title was regenerated this run.
    pub new_title: Option<String>,
    pub added_ids: Vec<i64>,
    pub member_count: i64,
}

/// A failure the run survived (or the one that ended it).
#[derive(Debug, Clone, PartialEq)]
pub struct RunIssue {
    pub stage: RunState,
    pub subject: String,
    pub error: PipelineError,
}

impl fmt::Display for RunIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.subject, self.error)
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// Opinions fetched as unclustered.
    pub processed: usize,
    pub new_themes: Vec<NewTheme>,
    pub grown_themes: Vec<GrownTheme>,
    /// Opinions left unclustered after provider failures.
    pub skipped: Vec<i64>,
    pub issues: Vec<RunIssue>,
    pub receipt: Option<CommitReceipt>,
    /// Stage and error that failed the run.
    pub failure: Option<RunIssue>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Loading,
            processed: 0,
            new_themes: Vec::new(),
            grown_themes: Vec::new(),
            skipped: Vec::new(),
            issues: Vec::new(),
            receipt: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn attached_count(&self) -> usize {
        self.grown_themes.iter().map(|g| g.added_ids.len()).sum()
    }

    /// The failure that ended the run, else the first survived issue.
    pub fn first_error(&self) -> Option<&RunIssue> {
        self.failure.as_ref().or_else(|| self.issues.first())
    }

    pub fn persisted(&self) -> bool {
        self.receipt.map(|r| r.persisted).unwrap_or(false)
    }

    fn note(&mut self, subject: String, error: impl Into<PipelineError>) {
        let issue = RunIssue {
            stage: self.state,
            subject,
            error: error.into(),
        };
        warn!(run_id = %self.run_id, stage = %issue.stage, "{}", issue);
        self.issues.push(issue);
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Refuse provider vectors with NaN or infinite components.
fn finite(vector: Vec<f32>) -> Result<Vec<f32>, ProviderError> {
    if vector.iter().all(|x| x.is_finite()) {
        Ok(vector)
    } else {
        Err(ProviderError::InvalidResponse(
            "embedding has a non-finite component".to_string(),
        ))
    }
}

/// Titles chosen for one plan.
struct Titles {
    seeds: Vec<(String, TitleSource)>,
    /// Parallel to `plan.attachments`.
    retitles: Vec<Option<String>>,
}

/// A single clustering run over a store and a provider.
pub struct Pipeline<'a> {
    store: &'a dyn ClusterStore,
    embedder: &'a dyn EmbeddingClient,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a dyn ClusterStore,
        embedder: &'a dyn EmbeddingClient,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            embedder,
            options,
        }
    }

    /// Execute the run. Never returns an error; the report says how it ended.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::new();
        match self.execute(&mut report).await {
            Ok(()) => report.state = RunState::Done,
            Err(error) => {
                let failure = RunIssue {
                    stage: report.state,
                    subject: "run".to_string(),
                    error,
                };
                report.state = RunState::Failed;
                report.failure = Some(failure);
            }
        }
        log_outcome(&report);
        report
    }

    fn enter(&self, report: &mut RunReport, state: RunState) {
        debug!(run_id = %report.run_id, state = %state, "entering state");
        report.state = state;
    }

    async fn execute(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        self.enter(report, RunState::Loading);
        let engine = SimilarityEngine::new(self.options.threshold, self.embedder.dims())?;
        let opinions = self
            .store
            .fetch_unclustered_opinions(self.options.batch_limit)
            .await?;
        report.processed = opinions.len();
        if opinions.is_empty() {
            return Ok(());
        }
        let existing = self.store.fetch_existing_clusters().await?;
        let engine = engine.with_existing(&existing)?;
        debug!(
            run_id = %report.run_id,
            opinions = opinions.len(),
            clusters = existing.len(),
            "loaded"
        );

        self.enter(report, RunState::Embedding);
        let embedded = self.embed_all(report, opinions).await;

        self.enter(report, RunState::Clustering);
        let plan = engine.plan(embedded)?;
        if plan.is_empty() {
            return Ok(());
        }

        self.enter(report, RunState::Titling);
        let titles = self.choose_titles(report, &plan).await?;

        self.enter(report, RunState::Committing);
        let mut writer = self.store.begin().await?;
        let written = write_plan(writer.as_mut(), &plan, &titles, report).await;
        let outcome = match written {
            Ok(()) => writer.commit().await,
            Err(e) => {
                if let Err(rb) = writer.rollback().await {
                    warn!(run_id = %report.run_id, error = %rb, "rollback failed");
                }
                Err(e)
            }
        };
        match outcome {
            Ok(receipt) => {
                report.receipt = Some(receipt);
                Ok(())
            }
            Err(e) => {
                // Nothing was written.
                report.new_themes.clear();
                report.grown_themes.clear();
                Err(e.into())
            }
        }
    }

    /// Embed every opinion, falling back to one call per opinion when the
    /// batch call fails. Opinions that still fail are skipped.
    ///
    /// A transient failure that outlasts the retries ends the fallback: the
    /// provider is down, so the remaining opinions are skipped unattempted.
    async fn embed_all(
        &self,
        report: &mut RunReport,
        opinions: Vec<Opinion>,
    ) -> Vec<(Opinion, Vec<f32>)> {
        let texts: Vec<String> = opinions.iter().map(|o| o.text.clone()).collect();
        let batch = with_retry(self.options.retry, "embed_batch", || {
            self.embedder.embed_batch(&texts)
        })
        .await;

        match batch {
            Ok(vectors) if vectors.len() == opinions.len() => {
                let mut embedded = Vec::with_capacity(opinions.len());
                for (opinion, vector) in opinions.into_iter().zip(vectors) {
                    match finite(vector) {
                        Ok(vector) => embedded.push((opinion, vector)),
                        Err(e) => {
                            report.note(format!("opinion {}", opinion.id), e);
                            report.skipped.push(opinion.id);
                        }
                    }
                }
                return embedded;
            }
            Ok(vectors) => report.note(
                "embedding batch".to_string(),
                ProviderError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    opinions.len(),
                    vectors.len()
                )),
            ),
            Err(e) => report.note("embedding batch".to_string(), e),
        }

        let mut embedded = Vec::with_capacity(opinions.len());
        let mut pending = opinions.into_iter();
        while let Some(opinion) = pending.next() {
            let result = with_retry(self.options.retry, "embed", || {
                self.embedder.embed(&opinion.text)
            })
            .await
            .and_then(finite);
            match result {
                Ok(vector) => embedded.push((opinion, vector)),
                Err(e) if e.is_retryable() => {
                    let rest: Vec<i64> = pending.map(|o| o.id).collect();
                    let subject = if rest.is_empty() {
                        format!("opinion {}", opinion.id)
                    } else {
                        format!("opinion {} ({} more not attempted)", opinion.id, rest.len())
                    };
                    report.note(subject, e);
                    report.skipped.push(opinion.id);
                    report.skipped.extend(rest);
                    break;
                }
                Err(e) => {
                    report.note(format!("opinion {}", opinion.id), e);
                    report.skipped.push(opinion.id);
                }
            }
        }
        embedded
    }

    async fn choose_titles(
        &self,
        report: &mut RunReport,
        plan: &ClusterPlan,
    ) -> Result<Titles, PipelineError> {
        let mut seeds = Vec::with_capacity(plan.seeds.len());
        for (n, seed) in plan.seeds.iter().enumerate() {
            let texts: Vec<String> = seed.members.iter().map(|m| m.text.clone()).collect();
            let samples = sample_texts(&texts, self.options.title_sample_size);
            match self.request_title(report, format!("new theme {}", n + 1), &samples).await {
                Some(title) => seeds.push((title, TitleSource::Provider)),
                None => seeds.push((fallback_title(&samples), TitleSource::Fallback)),
            }
        }

        let mut retitles = Vec::with_capacity(plan.attachments.len());
        for attachment in &plan.attachments {
            if !self.options.retitle_on_attach {
                retitles.push(None);
                continue;
            }
            let mut texts = self.store.fetch_member_texts(attachment.cluster_id).await?;
            texts.extend(attachment.members.iter().map(|m| m.text.clone()));
            let samples = sample_texts(&texts, self.options.title_sample_size);
            let subject = format!("cluster {}", attachment.cluster_id);
            retitles.push(self.request_title(report, subject, &samples).await);
        }

        Ok(Titles { seeds, retitles })
    }

    /// Provider title, or `None` after recording why not.
    async fn request_title(
        &self,
        report: &mut RunReport,
        subject: String,
        samples: &[String],
    ) -> Option<String> {
        let result = with_retry(self.options.retry, "generate_title", || {
            self.embedder.generate_title(samples)
        })
        .await;
        match result {
            Ok(raw) => match normalize_title(&raw) {
                Some(title) => Some(title),
                None => {
                    report.note(
                        subject,
                        ProviderError::InvalidResponse("empty title".to_string()),
                    );
                    None
                }
            },
            Err(e) => {
                report.note(subject, e);
                None
            }
        }
    }
}

/// Apply the plan through one writer, one call at a time.
async fn write_plan(
    writer: &mut (dyn ClusterWriter + '_),
    plan: &ClusterPlan,
    titles: &Titles,
    report: &mut RunReport,
) -> Result<(), StoreError> {
    for (attachment, retitle) in plan.attachments.iter().zip(&titles.retitles) {
        let added_ids: Vec<i64> = attachment.members.iter().map(|m| m.opinion_id).collect();
        writer
            .attach_to_cluster(
                attachment.cluster_id,
                &added_ids,
                &attachment.centroid,
                attachment.member_count,
            )
            .await?;
        if let Some(title) = retitle {
            writer.retitle_cluster(attachment.cluster_id, title).await?;
        }
        report.grown_themes.push(GrownTheme {
            cluster_id: attachment.cluster_id,
            title: attachment.title.clone(),
            new_title: retitle.clone(),
            added_ids,
            member_count: attachment.member_count,
        });
    }

    for (seed, (title, title_source)) in plan.seeds.iter().zip(&titles.seeds) {
        let member_ids: Vec<i64> = seed.members.iter().map(|m| m.opinion_id).collect();
        let cluster = writer
            .create_cluster(&NewCluster {
                title: title.clone(),
                centroid: seed.centroid.clone(),
                member_ids: member_ids.clone(),
                created_at: seed.created_at,
            })
            .await?;
        report.new_themes.push(NewTheme {
            cluster_id: Some(cluster.id),
            title: title.clone(),
            title_source: *title_source,
            member_ids,
        });
    }
    Ok(())
}

/// One structured event per finished run.
fn log_outcome(report: &RunReport) {
    let first_error = report.first_error().map(|e| e.to_string());
    let receipt = report.receipt.unwrap_or_default();
    info!(
        run_id = %report.run_id,
        state = %report.state,
        processed = report.processed,
        clusters_created = report.new_themes.len(),
        opinions_attached = report.attached_count(),
        skipped = report.skipped.len(),
        errors = report.issues.len(),
        persisted = receipt.persisted,
        first_error = first_error.as_deref().unwrap_or(""),
        "clustering run finished"
    );
}
