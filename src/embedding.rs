//! Embedding and title provider clients.
//!
//! Concrete implementations of [`EmbeddingClient`]:
//! - **[`DisabledClient`]** — always fails; used when no provider is configured.
//! - **[`OpenAIClient`]** — `POST /v1/embeddings` and `POST /v1/chat/completions`.
//! - **[`OllamaClient`]** — `POST /api/embed` and `POST /api/generate` on a local Ollama.
//! - **[`HashingClient`]** — offline token-hashing vectors for test mode and CI.
//!
//! # Provider Selection
//!
//! Use [`create_client`] to instantiate the client named by the config:
//!
//! ```rust,no_run
//! # use opinion_themes::config::EmbeddingConfig;
//! # use opinion_themes::embedding::create_client;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let client = create_client(&config).unwrap();
//! assert_eq!(client.model_name(), "disabled");
//! ```
//!
//! # Failure Classification
//!
//! Clients make exactly one attempt per call; [`crate::retry`] decides
//! whether to try again:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retryable

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};

use opinion_themes_core::embedding::EmbeddingClient;
use opinion_themes_core::error::{ConfigurationError, ProviderError};
use opinion_themes_core::title::normalize_title;

use crate::config::EmbeddingConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Instruction sent ahead of the sample opinions when asking for a title.
const TITLE_PROMPT: &str = "You name themes in citizen feedback for a city participation portal. \
Reply with one short title (at most 40 characters) describing the common topic of the opinions below. \
Use the language of the opinions. No quotes, no trailing period.";

// ============ HTTP transport ============

/// Shared JSON-over-HTTP plumbing with a per-call deadline.
struct HttpTransport {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpTransport {
    fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let deadline = Duration::from_secs(self.timeout_secs);
        match tokio::time::timeout(deadline, self.send(url, bearer, body)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                secs: self.timeout_secs,
            }),
        }
    }

    async fn send(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| self.transport_err(e))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()));
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(ProviderError::Http {
            status: status.as_u16(),
            body: body_text,
        })
    }

    fn transport_err(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// Run up to `concurrency` batch requests at once, keeping input order,
/// and check that `expected` vectors came back in total.
async fn fan_out<Fut>(
    expected: usize,
    requests: Vec<Fut>,
    concurrency: usize,
) -> Result<Vec<Vec<f32>>, ProviderError>
where
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>, ProviderError>>,
{
    let batches: Vec<Vec<Vec<f32>>> = futures::stream::iter(requests)
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;
    let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
    if vectors.len() != expected {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    Ok(vectors)
}

fn joined_samples(sample_texts: &[String]) -> String {
    sample_texts
        .iter()
        .map(|t| format!("- {}", t.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>, ProviderError> {
    let arr = value
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse(format!("missing {}", what)))?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::InvalidResponse(format!("non-numeric {}", what)))
        })
        .collect()
}

// ============ Disabled Client ============

/// A client that always returns [`ProviderError::Disabled`].
pub struct DisabledClient;

#[async_trait]
impl EmbeddingClient for DisabledClient {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Disabled)
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Disabled)
    }
    async fn generate_title(&self, _sample_texts: &[String]) -> Result<String, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

// ============ OpenAI Client ============

/// Client for the OpenAI API (or a compatible gateway via `embedding.url`).
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIClient {
    http: HttpTransport,
    api_key: String,
    base_url: String,
    model: String,
    title_model: String,
    dims: usize,
    batch_size: usize,
    concurrency: usize,
}

impl OpenAIClient {
    /// Create a new OpenAI client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::MissingCredential("OPENAI_API_KEY".to_string()))?;
        Self::with_api_key(config, api_key)
    }

    /// Like [`OpenAIClient::new`], with the credential passed in.
    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConfigurationError::Missing("embedding.model".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| ConfigurationError::Missing("embedding.dims".to_string()))?;

        Ok(Self {
            http: HttpTransport::new(config.timeout_secs)?,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            title_model: config
                .title_model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            model,
            dims,
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .http
            .post_json(
                &format!("{}/v1/embeddings", self.base_url),
                Some(&self.api_key),
                &body,
            )
            .await?;
        parse_openai_embeddings(&json)
    }
}

#[async_trait]
impl EmbeddingClient for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.request_embeddings(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let requests: Vec<_> = texts
            .chunks(self.batch_size.max(1))
            .map(|chunk| self.request_embeddings(chunk))
            .collect();
        fan_out(texts.len(), requests, self.concurrency).await
    }

    async fn generate_title(&self, sample_texts: &[String]) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.title_model,
            "temperature": 0,
            "max_tokens": 24,
            "messages": [
                { "role": "system", "content": TITLE_PROMPT },
                { "role": "user", "content": joined_samples(sample_texts) },
            ],
        });
        let json = self
            .http
            .post_json(
                &format!("{}/v1/chat/completions", self.base_url),
                Some(&self.api_key),
                &body,
            )
            .await?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".to_string())
            })?;
        normalize_title(content)
            .ok_or_else(|| ProviderError::InvalidResponse("empty title".to_string()))
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts `data[].embedding` and orders it by `data[].index`.
fn parse_openai_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::InvalidResponse("missing embedding".to_string()))?;
        indexed.push((index, parse_vector(embedding, "embedding")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Client ============

/// Client for a local Ollama instance (default `http://localhost:11434`).
///
/// Requires an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
/// Titles use `title_model`, falling back to `model`.
pub struct OllamaClient {
    http: HttpTransport,
    url: String,
    model: String,
    title_model: String,
    dims: usize,
    batch_size: usize,
    concurrency: usize,
}

impl OllamaClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConfigurationError::Missing("embedding.model".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| ConfigurationError::Missing("embedding.dims".to_string()))?;

        Ok(Self {
            http: HttpTransport::new(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            title_model: config.title_model.clone().unwrap_or_else(|| model.clone()),
            model,
            dims,
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .http
            .post_json(&format!("{}/api/embed", self.url), None, &body)
            .await
            .map_err(|e| match e {
                ProviderError::Transport(msg) => ProviderError::Transport(format!(
                    "is Ollama running at {}? {}",
                    self.url, msg
                )),
                other => other,
            })?;
        parse_ollama_embeddings(&json)
    }
}

#[async_trait]
impl EmbeddingClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.request_embeddings(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let requests: Vec<_> = texts
            .chunks(self.batch_size.max(1))
            .map(|chunk| self.request_embeddings(chunk))
            .collect();
        fan_out(texts.len(), requests, self.concurrency).await
    }

    async fn generate_title(&self, sample_texts: &[String]) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.title_model,
            "prompt": format!("{}\n\n{}", TITLE_PROMPT, joined_samples(sample_texts)),
            "stream": false,
        });
        let json = self
            .http
            .post_json(&format!("{}/api/generate", self.url), None, &body)
            .await?;
        let content = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("missing response".to_string()))?;
        normalize_title(content)
            .ok_or_else(|| ProviderError::InvalidResponse("empty title".to_string()))
    }
}

fn parse_ollama_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings array".to_string()))?;
    embeddings
        .iter()
        .map(|e| parse_vector(e, "embedding"))
        .collect()
}

// ============ Hashing Client ============

/// Words too common to say anything about a theme.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "are", "was", "our", "should", "would",
    "could", "more", "please", "have", "has", "not", "but", "very", "they", "there", "their",
    "about", "will", "can", "also", "all", "any", "into", "than", "then", "them", "its",
];

/// Offline client: each content word is hashed (SHA-256) into a signed
/// bucket, and the bucket counts are L2-normalized.
///
/// Texts sharing words get similar vectors, which is enough for fixture
/// runs without a network. Titles are the most frequent content words.
pub struct HashingClient {
    dims: usize,
}

impl HashingClient {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(&w.as_str()))
}

#[async_trait]
impl EmbeddingClient for HashingClient {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.vectorize(text))
    }

    async fn generate_title(&self, sample_texts: &[String]) -> Result<String, ProviderError> {
        let mut freq: HashMap<String, usize> = HashMap::new();
        for text in sample_texts {
            for token in tokens(text) {
                *freq.entry(token).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let words: Vec<String> = ranked
            .into_iter()
            .take(3)
            .map(|(w, _)| {
                let mut c = w.chars();
                match c.next() {
                    Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        if words.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "no content words to title".to_string(),
            ));
        }
        normalize_title(&words.join(" / "))
            .ok_or_else(|| ProviderError::InvalidResponse("empty title".to_string()))
    }
}

/// Create the [`EmbeddingClient`] named by `config.provider`.
///
/// # Supported Providers
///
/// | Config Value | Client |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledClient`] |
/// | `"openai"` | [`OpenAIClient`] |
/// | `"ollama"` | [`OllamaClient`] |
/// | `"hashing"` | [`HashingClient`] |
///
/// # Errors
///
/// Returns an error for unknown provider names or if the client cannot be
/// initialized (missing config or credential).
pub fn create_client(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClient)),
        "openai" => Ok(Box::new(OpenAIClient::new(config)?)),
        "ollama" => Ok(Box::new(OllamaClient::new(config)?)),
        "hashing" => Ok(Box::new(HashingClient::new(
            config.dims.unwrap_or(crate::config::HASHING_DIMS),
        ))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
