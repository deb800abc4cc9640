//! End-to-end runs of the clustering pipeline over the in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use opinion_themes::pipeline::{Pipeline, PipelineOptions, RunState, TitleSource};
use opinion_themes::retry::RetryPolicy;
use opinion_themes_core::embedding::EmbeddingClient;
use opinion_themes_core::error::{ConfigurationError, PipelineError, ProviderError};
use opinion_themes_core::store::memory::InMemoryStore;
use opinion_themes_core::title::fallback_title;

/// Client with a fixed vector per text and scriptable failures.
struct ScriptedClient {
    dims: usize,
    vectors: HashMap<String, Vec<f32>>,
    /// Texts whose single `embed` call always fails.
    broken: HashSet<String>,
    /// Every `embed_batch` fails with this error.
    batch_error: Option<ProviderError>,
    /// Every single `embed` call fails with HTTP 503.
    unavailable: bool,
    /// The first N `embed_batch` calls fail with HTTP 503.
    transient_batch_failures: AtomicUsize,
    title: Option<String>,
    batch_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    title_calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedClient {
    fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: HashMap::new(),
            broken: HashSet::new(),
            batch_error: None,
            unavailable: false,
            transient_batch_failures: AtomicUsize::new(0),
            title: Some("Generated title".to_string()),
            batch_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            title_calls: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    fn lookup(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if self.broken.contains(text) {
            return Err(ProviderError::Http {
                status: 400,
                body: "rejected".to_string(),
            });
        }
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no vector for {}", text)))
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedClient {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ProviderError::Http {
                status: 503,
                body: "down".to_string(),
            });
        }
        self.lookup(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.batch_error {
            return Err(e.clone());
        }
        let pending = self.transient_batch_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_batch_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(ProviderError::Http {
                status: 503,
                body: "busy".to_string(),
            });
        }
        texts.iter().map(|t| self.lookup(t)).collect()
    }

    async fn generate_title(&self, sample_texts: &[String]) -> Result<String, ProviderError> {
        self.title_calls
            .lock()
            .unwrap()
            .push(sample_texts.to_vec());
        self.title.clone().ok_or(ProviderError::Timeout { secs: 1 })
    }
}

fn options(threshold: f32) -> PipelineOptions {
    PipelineOptions {
        threshold,
        title_sample_size: 8,
        retitle_on_attach: false,
        batch_limit: None,
        retry: RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
        },
    }
}

/// Three opinions about bike lanes, two about the library.
fn two_groups() -> (InMemoryStore, ScriptedClient) {
    let store = InMemoryStore::new();
    let texts = [
        ("Protected bike lanes", vec![1.0, 0.0, 0.0]),
        ("Longer library hours", vec![0.0, 1.0, 0.0]),
        ("Bike lanes on Main St", vec![0.9, 0.1, 0.0]),
        ("Library open on Sundays", vec![0.1, 0.9, 0.0]),
        ("Safer cycling routes", vec![0.95, 0.05, 0.0]),
    ];
    let mut client = ScriptedClient::new(3);
    for (i, (text, vector)) in texts.iter().enumerate() {
        store.insert_opinion(text, Some(1), 100 + i as i64);
        client = client.with(text, vector.clone());
    }
    (store, client)
}

#[tokio::test]
async fn test_two_groups_form_two_clusters() {
    let (store, client) = two_groups();
    let report = Pipeline::new(&store, &client, options(0.8)).run().await;

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.processed, 5);
    assert_eq!(report.new_themes.len(), 2);
    assert!(report.issues.is_empty());

    let receipt = report.receipt.unwrap();
    assert!(receipt.persisted);
    assert_eq!(receipt.clusters_created, 2);
    assert_eq!(receipt.opinions_assigned, 5);

    assert_eq!(report.new_themes[0].member_ids, vec![1, 3, 5]);
    assert_eq!(report.new_themes[1].member_ids, vec![2, 4]);
    assert!(report
        .new_themes
        .iter()
        .all(|t| t.title == "Generated title" && t.title_source == TitleSource::Provider));

    let clusters = store.clusters();
    assert_eq!(clusters.len(), 2);
    let bikes = &clusters[0];
    assert_eq!(bikes.member_count, 3);
    let expected = [(1.0 + 0.9 + 0.95) / 3.0, (0.0 + 0.1 + 0.05) / 3.0, 0.0];
    for (got, want) in bikes.centroid.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
    }
    assert!(store.opinions().iter().all(|o| o.is_clustered()));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let (store, client) = two_groups();
    Pipeline::new(&store, &client, options(0.8)).run().await;
    let before = store.clusters();

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.processed, 0);
    assert!(report.receipt.is_none());
    assert_eq!(store.clusters(), before);
}

#[tokio::test]
async fn test_title_failure_falls_back() {
    let (store, mut client) = two_groups();
    client.title = None;

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.new_themes.len(), 2);
    assert_eq!(report.new_themes[0].title_source, TitleSource::Fallback);
    assert_eq!(
        report.new_themes[0].title,
        fallback_title(&["Protected bike lanes".to_string()])
    );
    // One issue per failed title, and the run still committed.
    assert_eq!(report.issues.len(), 2);
    assert!(report.persisted());
    // 1 attempt + 3 retries per seed; timeouts are retryable.
    assert_eq!(client.title_calls.lock().unwrap().len(), 8);
}

#[tokio::test]
async fn test_store_failure_rolls_back_everything() {
    let (store, client) = two_groups();
    store.fail_writes_after(1);

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.stage, RunState::Committing);
    assert_eq!(failure.error.kind(), "store");
    assert!(report.new_themes.is_empty());
    assert!(store.clusters().is_empty());
    assert!(store.opinions().iter().all(|o| !o.is_clustered()));

    // The next run sees every opinion again.
    store.clear_failures();
    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.processed, 5);
    assert_eq!(store.clusters().len(), 2);
}

#[tokio::test]
async fn test_commit_failure_rolls_back() {
    let (store, client) = two_groups();
    store.fail_commits();

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Failed);
    assert!(store.clusters().is_empty());
    assert!(store.opinions().iter().all(|o| !o.is_clustered()));
}

#[tokio::test]
async fn test_transient_batch_failure_is_retried() {
    let (store, client) = two_groups();
    client.transient_batch_failures.store(2, Ordering::SeqCst);

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert!(report.issues.is_empty());
    assert_eq!(client.batch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.receipt.unwrap().opinions_assigned, 5);
}

#[tokio::test]
async fn test_failed_opinion_is_skipped_and_retried_next_run() {
    let (store, mut client) = two_groups();
    client.batch_error = Some(ProviderError::Http {
        status: 400,
        body: "batch too large".to_string(),
    });
    client.broken.insert("Longer library hours".to_string());

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.skipped, vec![2]);
    // Batch failure plus the skipped opinion.
    assert_eq!(report.issues.len(), 2);
    assert_eq!(report.receipt.unwrap().opinions_assigned, 4);
    assert!(!store.opinion(2).unwrap().is_clustered());

    client.broken.clear();
    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.processed, 1);
    // Joins the library cluster seeded by opinion 4.
    assert_eq!(report.attached_count(), 1);
    assert!(store.opinion(2).unwrap().is_clustered());
}

#[tokio::test]
async fn test_dimension_mismatch_fails_before_writing() {
    let (store, client) = two_groups();
    let client = client.with("Safer cycling routes", vec![1.0, 0.0]);

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, RunState::Clustering);
    assert!(matches!(
        failure.error,
        PipelineError::Configuration(ConfigurationError::DimensionMismatch {
            expected: 3,
            actual: 2,
            ..
        })
    ));
    assert!(store.clusters().is_empty());
}

#[tokio::test]
async fn test_stored_centroid_mismatch_fails_before_embedding() {
    let (store, client) = two_groups();
    store.insert_cluster("Old theme", vec![1.0, 0.0], 1);

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, RunState::Loading);
    assert!(matches!(
        failure.error,
        PipelineError::Configuration(ConfigurationError::DimensionMismatch { .. })
    ));
    assert_eq!(client.batch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_threshold_fails_before_loading() {
    let (store, client) = two_groups();
    let report = Pipeline::new(&store, &client, options(1.5)).run().await;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure.unwrap().stage, RunState::Loading);
    assert_eq!(report.processed, 0);
    assert_eq!(client.batch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_provider_outage_stops_single_fallback() {
    let (store, mut client) = two_groups();
    client.batch_error = Some(ProviderError::Http {
        status: 503,
        body: "down".to_string(),
    });
    client.unavailable = true;

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.skipped, vec![1, 2, 3, 4, 5]);
    // Batch failure plus one issue covering the untried opinions.
    assert_eq!(report.issues.len(), 2);
    assert!(report.issues[1].subject.contains("4 more not attempted"));
    // First opinion only: one call plus three retries.
    assert_eq!(client.embed_calls.load(Ordering::SeqCst), 4);
    assert!(store.opinions().iter().all(|o| !o.is_clustered()));
}

#[tokio::test]
async fn test_non_finite_embedding_is_skipped() {
    let (store, client) = two_groups();
    let client = client.with("Longer library hours", vec![f32::NAN, 1.0, 0.0]);

    let report = Pipeline::new(&store, &client, options(0.8)).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.skipped, vec![2]);
    assert!(matches!(
        report.issues[0].error,
        PipelineError::Provider(ProviderError::InvalidResponse(_))
    ));
    assert_eq!(report.receipt.unwrap().opinions_assigned, 4);
}

#[tokio::test]
async fn test_attach_to_existing_cluster_recomputes_exact_centroid() {
    let store = InMemoryStore::new();
    let cluster_id = store.insert_cluster("Parks", vec![1.0, 0.0], 10);
    let a = store.insert_opinion("older park idea", None, 1);
    let b = store.insert_opinion("another park idea", None, 2);
    store.insert_member(cluster_id, a).unwrap();
    store.insert_member(cluster_id, b).unwrap();
    let new_id = store.insert_opinion("Shade trees in the park", None, 50);

    let client = ScriptedClient::new(2).with("Shade trees in the park", vec![0.8, 0.6]);
    let report = Pipeline::new(&store, &client, options(0.5)).run().await;

    assert_eq!(report.state, RunState::Done);
    assert!(report.new_themes.is_empty());
    assert_eq!(report.grown_themes.len(), 1);
    assert_eq!(report.grown_themes[0].added_ids, vec![new_id]);
    assert_eq!(report.grown_themes[0].member_count, 3);

    let stored = &store.clusters()[0];
    assert_eq!(stored.member_count, 3);
    assert_eq!(stored.title, "Parks");
    let want = [(2.0 * 1.0 + 0.8) / 3.0, (2.0 * 0.0 + 0.6) / 3.0];
    for (got, want) in stored.centroid.iter().zip(want.iter()) {
        assert!((got - want).abs() < 1e-6);
    }
    // No retitle without the option.
    assert!(client.title_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retitle_on_attach_uses_all_member_texts() {
    let store = InMemoryStore::new();
    let cluster_id = store.insert_cluster("Parks", vec![1.0, 0.0], 10);
    let a = store.insert_opinion("older park idea", None, 1);
    store.insert_member(cluster_id, a).unwrap();
    store.insert_opinion("new park idea", None, 50);

    let mut client = ScriptedClient::new(2).with("new park idea", vec![1.0, 0.0]);
    client.title = Some("\"Parks and green space.\"".to_string());
    let mut opts = options(0.5);
    opts.retitle_on_attach = true;

    let report = Pipeline::new(&store, &client, opts).run().await;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(
        report.grown_themes[0].new_title.as_deref(),
        Some("Parks and green space")
    );
    assert_eq!(store.clusters()[0].title, "Parks and green space");
    assert_eq!(
        client.title_calls.lock().unwrap()[0],
        vec!["older park idea".to_string(), "new park idea".to_string()]
    );
}

#[tokio::test]
async fn test_title_sample_is_capped() {
    let store = InMemoryStore::new();
    let mut client = ScriptedClient::new(2);
    for i in 0..5 {
        let text = format!("same idea {}", i);
        store.insert_opinion(&text, None, i);
        client = client.with(&text, vec![1.0, 0.0]);
    }
    let mut opts = options(0.9);
    opts.title_sample_size = 2;

    let report = Pipeline::new(&store, &client, opts).run().await;
    assert_eq!(report.new_themes.len(), 1);
    assert_eq!(
        client.title_calls.lock().unwrap()[0],
        vec!["same idea 0".to_string(), "same idea 1".to_string()]
    );
}

#[tokio::test]
async fn test_batch_limit_processes_oldest_first() {
    let (store, client) = two_groups();
    let mut opts = options(0.8);
    opts.batch_limit = Some(2);

    let report = Pipeline::new(&store, &client, opts).run().await;
    assert_eq!(report.processed, 2);
    assert!(store.opinion(1).unwrap().is_clustered());
    assert!(store.opinion(2).unwrap().is_clustered());
    assert!(!store.opinion(3).unwrap().is_clustered());
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let (store_a, client_a) = two_groups();
    let (store_b, client_b) = two_groups();
    Pipeline::new(&store_a, &client_a, options(0.8)).run().await;
    Pipeline::new(&store_b, &client_b, options(0.8)).run().await;
    assert_eq!(store_a.clusters(), store_b.clusters());
    assert_eq!(store_a.opinions(), store_b.opinions());
}
