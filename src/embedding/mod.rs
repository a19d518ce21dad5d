//! Embedding provider abstraction and pooling primitives.
//!
//! This module defines the interface for text embedding generation, the masked-mean
//! pooling law shared by every local encoder, and multi-document averaging.
//!
//! The abstraction allows the system to swap between different encoders without
//! changing the core logic of ingestion, topic discovery or ranking.

pub mod engine;
pub mod onnx;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Vector;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Encoder runtime failure (tokenization, inference)
    #[error("Encoder failed: {0}")]
    ApiError(String),

    /// Invalid input text (e.g., empty)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., missing model files)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No encoder registered for the requested model
    #[error("No encoder registered for model '{0}'")]
    UnknownModel(String),

    /// Averaging was asked to pool zero vectors
    #[error("Cannot pool an empty list of vectors")]
    EmptyPool,

    /// Vectors in one pool disagree on length
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Trait for text embedding providers.
///
/// Implementors of this trait can generate vector embeddings from text inputs.
/// The trait is async so inference can be moved off the runtime threads.
///
/// # Example Usage
/// ```ignore
/// let provider = OnnxEncoder::load(&spec)?;
/// let embedding = provider.embed("Research paper abstract").await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Arguments
    /// * `text` - The input text to embed
    ///
    /// # Returns
    /// A vector of f32 values of length `dimension()`
    ///
    /// # Errors
    /// Returns `EmbeddingError` if the embedding generation fails
    async fn embed(&self, text: &str) -> EmbeddingResult<Vector>;

    /// Generate embeddings for multiple texts in a single batch.
    ///
    /// # Arguments
    /// * `texts` - Slice of text inputs to embed
    ///
    /// # Returns
    /// A vector of embedding vectors, in the same order as the input texts
    ///
    /// # Errors
    /// Returns `EmbeddingError` if any embedding generation fails
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vector>>;

    /// Get the dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    /// Get the model name/identifier for this provider.
    fn model_name(&self) -> &str;

    /// Number of inputs clipped to the encoder's context length so far.
    fn truncated_inputs(&self) -> usize {
        0
    }
}

/// Masked-mean pooling over a batch of token representations.
///
/// `hidden` is the flattened `[batch, seq_len, dim]` output of an encoder and `mask`
/// the flattened `[batch, seq_len]` attention mask. Every output row is
/// `sum(hidden * mask) / sum(mask)`, so padding positions never influence the result.
/// A row whose mask is all zero pools to the zero vector.
///
/// # Errors
/// Returns `EmbeddingError::DimensionMismatch` when the buffers do not match the shape.
pub fn masked_mean_pool(
    hidden: &[f32],
    mask: &[i64],
    batch: usize,
    seq_len: usize,
    dim: usize,
) -> EmbeddingResult<Vec<Vector>> {
    if hidden.len() != batch * seq_len * dim {
        return Err(EmbeddingError::DimensionMismatch {
            expected: batch * seq_len * dim,
            actual: hidden.len(),
        });
    }
    if mask.len() != batch * seq_len {
        return Err(EmbeddingError::DimensionMismatch {
            expected: batch * seq_len,
            actual: mask.len(),
        });
    }

    let mut pooled = Vec::with_capacity(batch);
    for row in 0..batch {
        let mut sum = vec![0.0_f64; dim];
        let mut mask_sum = 0.0_f64;

        for token in 0..seq_len {
            let weight = mask[row * seq_len + token] as f64;
            if weight == 0.0 {
                continue;
            }
            mask_sum += weight;
            let offset = (row * seq_len + token) * dim;
            for (acc, value) in sum.iter_mut().zip(&hidden[offset..offset + dim]) {
                *acc += *value as f64 * weight;
            }
        }

        if mask_sum > 0.0 {
            pooled.push(sum.into_iter().map(|v| (v / mask_sum) as f32).collect());
        } else {
            pooled.push(vec![0.0; dim]);
        }
    }

    Ok(pooled)
}

/// Unweighted arithmetic mean of a list of vectors.
///
/// # Errors
/// * `EmbeddingError::EmptyPool` if `vectors` is empty
/// * `EmbeddingError::DimensionMismatch` if the vectors differ in length
pub fn average_pool(vectors: &[Vector]) -> EmbeddingResult<Vector> {
    let first = vectors.first().ok_or(EmbeddingError::EmptyPool)?;
    let dim = first.len();

    let mut sum = vec![0.0_f64; dim];
    for vector in vectors {
        if vector.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }
        for (acc, value) in sum.iter_mut().zip(vector) {
            *acc += *value as f64;
        }
    }

    let n = vectors.len() as f64;
    Ok(sum.into_iter().map(|v| (v / n) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_pool_identity() {
        let v = vec![0.5, -1.25, 3.0];
        assert_eq!(average_pool(&[v.clone()]).unwrap(), v);
    }

    #[test]
    fn test_average_pool_mean() {
        let pooled = average_pool(&[vec![1.0, 2.0], vec![3.0, 6.0]]).unwrap();
        assert_eq!(pooled, vec![2.0, 4.0]);
    }

    #[test]
    fn test_average_pool_empty_is_error() {
        assert!(matches!(average_pool(&[]), Err(EmbeddingError::EmptyPool)));
    }

    #[test]
    fn test_average_pool_rejects_mixed_dimensions() {
        let result = average_pool(&[vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_masked_mean_pool_ignores_padding() {
        // Two rows, three tokens, dim 2. The second row has one padding token
        // whose hidden state is huge and must not leak into the mean.
        let hidden = vec![
            1.0, 1.0, 3.0, 3.0, 5.0, 5.0, // row 0
            2.0, 4.0, 4.0, 8.0, 1000.0, 1000.0, // row 1
        ];
        let mask = vec![1, 1, 1, 1, 1, 0];
        let pooled = masked_mean_pool(&hidden, &mask, 2, 3, 2).unwrap();

        assert_eq!(pooled.len(), 2);
        assert_eq!(pooled[0], vec![3.0, 3.0]);
        assert_eq!(pooled[1], vec![3.0, 6.0]);
    }

    #[test]
    fn test_masked_mean_pool_all_masked_is_zero() {
        let pooled = masked_mean_pool(&[1.0, 2.0], &[0], 1, 1, 2).unwrap();
        assert_eq!(pooled[0], vec![0.0, 0.0]);
    }

    #[test]
    fn test_masked_mean_pool_shape_checked() {
        let result = masked_mean_pool(&[1.0, 2.0, 3.0], &[1], 1, 1, 2);
        assert!(matches!(result, Err(EmbeddingError::DimensionMismatch { .. })));
    }
}
