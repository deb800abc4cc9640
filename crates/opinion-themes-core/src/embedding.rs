//! Embedding client trait and vector utilities.
//!
//! Defines the [`EmbeddingClient`] trait that every provider backend
//! implements, plus pure helpers for vector serialization, similarity,
//! and centroid computation.
//!
//! Concrete clients (OpenAI, Ollama, offline hashing) live in the
//! `opinion-themes` app crate.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Text → vector and text set → title.
///
/// A client makes a single attempt per call. Retry and backoff belong to
/// the caller, which decides per [`ProviderError::is_retryable`].
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts, returning vectors in input order.
    ///
    /// The default issues sequential [`embed`](EmbeddingClient::embed)
    /// calls. Batching overrides must produce the same vectors.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Produce a short (≤ ~40 chars) label for the common theme of the texts.
    async fn generate_title(&self, sample_texts: &[String]) -> Result<String, ProviderError>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use opinion_themes_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]. Trailing bytes that do not form a full
/// `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths. Callers that must reject mismatched lengths check them first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Coordinate-wise weighted mean of a base centroid and extra vectors.
///
/// `base` is a centroid that already stands for `base_count` members
/// (pass `None` / `0` for a fresh cluster). The result is the exact mean of
/// all `base_count + members.len()` embeddings, accumulated in `f64` in a
/// fixed order so repeated calls on the same inputs agree bit for bit.
///
/// All vectors must share `dims`; shorter or longer inputs are the caller's
/// bug and are truncated/zero-padded to `dims`.
pub fn mean_vector(
    dims: usize,
    base: Option<(&[f32], i64)>,
    members: &[&[f32]],
) -> Vec<f32> {
    let mut sum = vec![0.0f64; dims];
    let mut count = 0i64;

    if let Some((centroid, base_count)) = base {
        if base_count > 0 {
            for (acc, &v) in sum.iter_mut().zip(centroid.iter()) {
                *acc += v as f64 * base_count as f64;
            }
            count += base_count;
        }
    }

    for member in members {
        for (acc, &v) in sum.iter_mut().zip(member.iter()) {
            *acc += v as f64;
        }
        count += 1;
    }

    if count == 0 {
        return vec![0.0; dims];
    }

    sum.into_iter().map(|s| (s / count as f64) as f32).collect()
}
