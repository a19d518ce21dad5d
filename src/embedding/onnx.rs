//! Local ONNX encoder.
//!
//! Runs a transformer exported to ONNX with `ort`, tokenizes with a HuggingFace
//! `tokenizer.json`, and mean-pools the last hidden state under the attention mask.
//! Every model kind goes through the same pooling law; only the context length and
//! whether the graph takes `token_type_ids` differ between encoders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer, TruncationParams};
use tracing::debug;

use super::{masked_mean_pool, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::config::EncoderSpec;
use crate::models::Vector;

/// Sentence encoder backed by a local ONNX session.
#[derive(Clone)]
pub struct OnnxEncoder {
    /// Inference session; the lock scopes one forward pass
    session: Arc<Mutex<Session>>,

    /// Tokenizer configured to truncate at the encoder's context length
    tokenizer: Arc<Tokenizer>,

    /// Model identifier
    model_name: String,

    /// Hidden dimension of the pooled output
    dimension: usize,

    /// Whether `token_type_ids` is fed to the graph
    token_type_ids: bool,

    /// Count of inputs clipped by truncation
    truncated: Arc<AtomicUsize>,
}

impl OnnxEncoder {
    /// Load an encoder from `spec.model_dir`.
    ///
    /// Expects `model.onnx` and `tokenizer.json` in the directory.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if either file is missing or fails to load
    pub fn load(spec: &EncoderSpec) -> EmbeddingResult<Self> {
        let model_path = spec.model_dir.join("model.onnx");
        let tokenizer_path = spec.model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(EmbeddingError::ConfigError(format!(
                "Encoder model not found: {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(EmbeddingError::ConfigError(format!(
                "Encoder tokenizer not found: {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|builder| builder.commit_from_file(&model_path))
            .map_err(|e| {
                EmbeddingError::ConfigError(format!(
                    "Failed to load encoder {}: {}",
                    model_path.display(),
                    e
                ))
            })?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to load tokenizer: {}", e))
        })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: spec.max_length,
                ..Default::default()
            }))
            .map_err(|e| EmbeddingError::ConfigError(format!("Invalid truncation: {}", e)))?;
        tokenizer.with_padding(None);

        debug!(
            model = %spec.kind,
            max_length = spec.max_length,
            "Loaded encoder from {}",
            spec.model_dir.display()
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            model_name: spec.kind.to_string(),
            dimension: spec.dimension,
            token_type_ids: spec.token_type_ids,
            truncated: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn encode_sync(&self, texts: &[String]) -> EmbeddingResult<Vec<Vector>> {
        let encodings = texts
            .iter()
            .map(|text| {
                self.tokenizer
                    .encode(text.as_str(), true)
                    .map_err(|e| EmbeddingError::ApiError(format!("Tokenization failed: {}", e)))
            })
            .collect::<EmbeddingResult<Vec<Encoding>>>()?;

        for (index, encoding) in encodings.iter().enumerate() {
            if !encoding.get_overflowing().is_empty() {
                self.truncated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    model = %self.model_name,
                    index,
                    kept = encoding.get_ids().len(),
                    "Input truncated to encoder context length"
                );
            }
        }

        let batch = encodings.len();
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        if seq_len == 0 {
            return Ok(vec![vec![0.0; self.dimension]; batch]);
        }

        let mut input_ids: Vec<i64> = Vec::with_capacity(batch * seq_len);
        let mut attention_mask: Vec<i64> = Vec::with_capacity(batch * seq_len);
        let mut type_ids: Vec<i64> = Vec::with_capacity(batch * seq_len);

        for encoding in &encodings {
            let len = encoding.get_ids().len();
            let pad = seq_len - len;
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            input_ids.extend(std::iter::repeat(0).take(pad));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
            attention_mask.extend(std::iter::repeat(0).take(pad));
            type_ids.extend(encoding.get_type_ids().iter().map(|&t| t as i64));
            type_ids.extend(std::iter::repeat(0).take(pad));
        }

        let shape = [batch as i64, seq_len as i64];
        let tensor = |data: Vec<i64>, name: &str| {
            Tensor::from_array((shape, data)).map_err(|e| {
                EmbeddingError::ApiError(format!("Failed to build {} tensor: {}", name, e))
            })
        };
        let ids_tensor = tensor(input_ids, "input_ids")?;
        let mask_tensor = tensor(attention_mask.clone(), "attention_mask")?;

        let hidden = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| EmbeddingError::Other(format!("Session lock poisoned: {}", e)))?;

            let outputs = if self.token_type_ids {
                let type_tensor = tensor(type_ids, "token_type_ids")?;
                session.run(ort::inputs! {
                    "input_ids" => ids_tensor,
                    "attention_mask" => mask_tensor,
                    "token_type_ids" => type_tensor
                })
            } else {
                session.run(ort::inputs! {
                    "input_ids" => ids_tensor,
                    "attention_mask" => mask_tensor
                })
            }
            .map_err(|e| EmbeddingError::ApiError(format!("Inference failed: {}", e)))?;

            let (_shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbeddingError::ApiError(format!("Bad encoder output: {}", e)))?;
            data.to_vec()
        };

        masked_mean_pool(&hidden, &attention_mask, batch, seq_len, self.dimension)
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEncoder {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vector> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(
                "All texts must be non-empty".to_string(),
            ));
        }

        let encoder = self.clone();
        let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        tokio::task::spawn_blocking(move || encoder.encode_sync(&texts))
            .await
            .map_err(|e| EmbeddingError::Other(format!("Encoder task failed: {}", e)))?
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn truncated_inputs(&self) -> usize {
        self.truncated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OnnxEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEncoder")
            .field("model_name", &self.model_name)
            .field("dimension", &self.dimension)
            .field("token_type_ids", &self.token_type_ids)
            .finish()
    }
}
