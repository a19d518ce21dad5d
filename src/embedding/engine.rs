//! The embedding engine: one owned instance holding every loaded encoder.
//!
//! Constructed once at process start and passed by reference to ingestion, topic
//! discovery, evaluation and serving. It never reloads weights per call.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::onnx::OnnxEncoder;
use super::{average_pool, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::config::EncoderSpec;
use crate::models::{ModelKind, Pooling, RepresentationVariant, Researcher, Vector};

/// Abstracts embedded per encoder call.
const ABSTRACT_BATCH: usize = 8;

/// Registry of encoders keyed by model kind, with one designated primary model.
pub struct EmbeddingEngine {
    encoders: BTreeMap<ModelKind, Box<dyn EmbeddingProvider>>,
    primary: ModelKind,
}

impl EmbeddingEngine {
    /// Create an engine with no encoders registered.
    pub fn new(primary: ModelKind) -> Self {
        Self {
            encoders: BTreeMap::new(),
            primary,
        }
    }

    /// Load an ONNX encoder for every spec.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if any encoder fails to load or the
    /// primary model has no spec.
    pub fn from_specs(specs: &[EncoderSpec], primary: ModelKind) -> EmbeddingResult<Self> {
        let mut engine = Self::new(primary);
        for spec in specs {
            engine.register(spec.kind, Box::new(OnnxEncoder::load(spec)?));
        }
        if !engine.encoders.contains_key(&primary) {
            return Err(EmbeddingError::ConfigError(format!(
                "no encoder spec for primary model '{}'",
                primary
            )));
        }
        Ok(engine)
    }

    /// Register (or replace) the encoder for a model kind.
    pub fn register(&mut self, kind: ModelKind, encoder: Box<dyn EmbeddingProvider>) {
        debug!(model = %kind, dimension = encoder.dimension(), "Registered encoder");
        self.encoders.insert(kind, encoder);
    }

    pub fn primary(&self) -> ModelKind {
        self.primary
    }

    pub fn models(&self) -> impl Iterator<Item = ModelKind> + '_ {
        self.encoders.keys().copied()
    }

    fn encoder(&self, kind: ModelKind) -> EmbeddingResult<&dyn EmbeddingProvider> {
        self.encoders
            .get(&kind)
            .map(|e| e.as_ref())
            .ok_or_else(|| EmbeddingError::UnknownModel(kind.to_string()))
    }

    /// Hidden dimension of an encoder.
    pub fn dimension(&self, kind: ModelKind) -> EmbeddingResult<usize> {
        Ok(self.encoder(kind)?.dimension())
    }

    /// Embed one text with the given encoder.
    pub async fn embed(&self, text: &str, kind: ModelKind) -> EmbeddingResult<Vector> {
        self.encoder(kind)?.embed(text).await
    }

    /// Embed many texts with the given encoder, in chunks.
    pub async fn embed_many(&self, texts: &[&str], kind: ModelKind) -> EmbeddingResult<Vec<Vector>> {
        let encoder = self.encoder(kind)?;
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(ABSTRACT_BATCH) {
            vectors.extend(encoder.embed_batch(chunk).await?);
        }
        Ok(vectors)
    }

    /// Embed a query with the primary encoder.
    pub async fn embed_query(&self, text: &str) -> EmbeddingResult<Vector> {
        self.embed(text, self.primary).await
    }

    /// Total inputs clipped to context length across all encoders.
    pub fn truncated_inputs(&self) -> usize {
        self.encoders.values().map(|e| e.truncated_inputs()).sum()
    }

    /// Build every requested researcher-level representation.
    ///
    /// Each abstract is embedded once per model. The primary model's vectors are also
    /// stored on the abstracts themselves. The researcher's embedding map is replaced
    /// wholesale.
    ///
    /// # Errors
    /// * `EmbeddingError::EmptyPool` if an averaged variant is requested for a
    ///   researcher without abstracts
    /// * Any encoder error
    pub async fn represent(
        &self,
        researcher: &mut Researcher,
        variants: &[RepresentationVariant],
    ) -> EmbeddingResult<()> {
        let texts: Vec<&str> = researcher.abstracts.iter().map(|a| a.text.as_str()).collect();
        let keyword_text = researcher.keyword_text();

        let mut models: BTreeSet<ModelKind> = variants
            .iter()
            .filter(|v| v.pooling == Pooling::Averaged)
            .map(|v| v.model)
            .collect();
        if !texts.is_empty() {
            models.insert(self.primary);
        }

        let mut abstract_vectors: BTreeMap<ModelKind, Vec<Vector>> = BTreeMap::new();
        let mut keyword_vectors: BTreeMap<ModelKind, Vector> = BTreeMap::new();
        for model in models {
            abstract_vectors.insert(model, self.embed_many(&texts, model).await?);

            let wants_keywords = variants
                .iter()
                .any(|v| v.model == model && v.pooling == Pooling::Averaged && v.with_keywords);
            if let (true, Some(keywords)) = (wants_keywords, keyword_text.as_deref()) {
                keyword_vectors.insert(model, self.embed(keywords, model).await?);
            }
        }

        let mut embeddings = BTreeMap::new();
        for variant in variants {
            let vector = match variant.pooling {
                Pooling::Concatenated => {
                    let mut joined = texts.join(" ");
                    if let (true, Some(keywords)) = (variant.with_keywords, keyword_text.as_deref()) {
                        joined.push(' ');
                        joined.push_str(keywords);
                    }
                    self.embed(joined.trim(), variant.model).await?
                }
                Pooling::Averaged => {
                    let mut pool = abstract_vectors
                        .get(&variant.model)
                        .cloned()
                        .unwrap_or_default();
                    if variant.with_keywords {
                        if let Some(keywords) = keyword_vectors.get(&variant.model) {
                            pool.push(keywords.clone());
                        }
                    }
                    average_pool(&pool)?
                }
            };
            embeddings.insert(variant.name(), vector);
        }

        if let Some(primary_vectors) = abstract_vectors.remove(&self.primary) {
            for (abs, vector) in researcher.abstracts.iter_mut().zip(primary_vectors) {
                abs.embedding = Some(vector);
            }
        }
        researcher.embeddings = embeddings;

        debug!(
            researcher = %researcher.uuid,
            variants = researcher.embeddings.len(),
            abstracts = researcher.abstracts.len(),
            "Built researcher representations"
        );
        Ok(())
    }
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("models", &self.encoders.keys().collect::<Vec<_>>())
            .field("primary", &self.primary)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Abstract;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Deterministic encoder: vector of byte sums over `dim` buckets, recording calls.
    #[derive(Clone, Default)]
    pub(crate) struct MockEncoder {
        pub(crate) dim: usize,
        pub(crate) calls: Arc<Mutex<Vec<String>>>,
        pub(crate) fail: bool,
    }

    impl MockEncoder {
        pub(crate) fn new(dim: usize) -> Self {
            Self {
                dim,
                ..Default::default()
            }
        }

        pub(crate) fn vector_for(&self, text: &str) -> Vector {
            let mut v = vec![0.0; self.dim];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dim] += b as f32 / 100.0;
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEncoder {
        async fn embed(&self, text: &str) -> EmbeddingResult<Vector> {
            if self.fail {
                return Err(EmbeddingError::ApiError("mock failure".to_string()));
            }
            self.calls.lock().unwrap().push(text.to_string());
            Ok(self.vector_for(text))
        }

        async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vector>> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn researcher() -> Researcher {
        let mut r = Researcher::new("r1");
        r.keywords.insert("robotics".to_string());
        r.abstracts.push(Abstract::new("a1".into(), "T1".into(), None, "first abstract".into()));
        r.abstracts.push(Abstract::new("a2".into(), "T2".into(), None, "second one".into()));
        r
    }

    #[tokio::test]
    async fn test_represent_builds_all_requested_variants() {
        let mut engine = EmbeddingEngine::new(ModelKind::Specter2);
        engine.register(ModelKind::Specter2, Box::new(MockEncoder::new(4)));
        engine.register(ModelKind::ModernBert, Box::new(MockEncoder::new(6)));

        let variants = vec![
            RepresentationVariant::new(ModelKind::Specter2, Pooling::Averaged, false),
            RepresentationVariant::new(ModelKind::Specter2, Pooling::Averaged, true),
            RepresentationVariant::new(ModelKind::ModernBert, Pooling::Concatenated, true),
        ];
        let mut r = researcher();
        engine.represent(&mut r, &variants).await.unwrap();

        assert_eq!(r.embeddings.len(), 3);
        assert_eq!(r.embedding("specter2_averaged_embedding").unwrap().len(), 4);
        assert_eq!(
            r.embedding("modernbert_concatenated_embedding_with_keywords").unwrap().len(),
            6
        );
        assert!(r.abstracts.iter().all(|a| a.embedding.as_ref().map(Vec::len) == Some(4)));
    }

    #[tokio::test]
    async fn test_averaged_variant_is_mean_of_abstract_vectors() {
        let mock = MockEncoder::new(3);
        let mut engine = EmbeddingEngine::new(ModelKind::Bert);
        engine.register(ModelKind::Bert, Box::new(mock.clone()));

        let plain = RepresentationVariant::new(ModelKind::Bert, Pooling::Averaged, false);
        let keyed = RepresentationVariant::new(ModelKind::Bert, Pooling::Averaged, true);
        let mut r = researcher();
        engine.represent(&mut r, &[plain, keyed]).await.unwrap();

        let a = mock.vector_for("first abstract");
        let b = mock.vector_for("second one");
        let k = mock.vector_for("robotics");
        let expected_plain = average_pool(&[a.clone(), b.clone()]).unwrap();
        let expected_keyed = average_pool(&[a, b, k]).unwrap();

        assert_eq!(r.embedding(&plain.name()).unwrap(), expected_plain.as_slice());
        assert_eq!(r.embedding(&keyed.name()).unwrap(), expected_keyed.as_slice());
    }

    #[tokio::test]
    async fn test_concatenated_variant_embeds_joined_text_once() {
        let mock = MockEncoder::new(3);
        let mut engine = EmbeddingEngine::new(ModelKind::ModernBert);
        engine.register(ModelKind::ModernBert, Box::new(mock.clone()));

        let variant = RepresentationVariant::new(ModelKind::ModernBert, Pooling::Concatenated, true);
        let mut r = researcher();
        engine.represent(&mut r, &[variant]).await.unwrap();

        let calls = mock.calls.lock().unwrap();
        assert!(calls.contains(&"first abstract second one robotics".to_string()));
        assert_eq!(
            r.embedding(&variant.name()).unwrap(),
            mock.vector_for("first abstract second one robotics").as_slice()
        );
    }

    #[tokio::test]
    async fn test_keyword_variant_without_keywords_equals_plain() {
        let mut engine = EmbeddingEngine::new(ModelKind::Bert);
        engine.register(ModelKind::Bert, Box::new(MockEncoder::new(3)));

        let plain = RepresentationVariant::new(ModelKind::Bert, Pooling::Averaged, false);
        let keyed = RepresentationVariant::new(ModelKind::Bert, Pooling::Averaged, true);
        let mut r = researcher();
        r.keywords.clear();
        engine.represent(&mut r, &[plain, keyed]).await.unwrap();

        assert_eq!(r.embedding(&plain.name()), r.embedding(&keyed.name()));
    }

    #[tokio::test]
    async fn test_averaged_without_abstracts_is_empty_pool() {
        let mut engine = EmbeddingEngine::new(ModelKind::Bert);
        engine.register(ModelKind::Bert, Box::new(MockEncoder::new(3)));

        let mut r = Researcher::new("empty");
        let variant = RepresentationVariant::new(ModelKind::Bert, Pooling::Averaged, false);
        let result = engine.represent(&mut r, &[variant]).await;
        assert!(matches!(result, Err(EmbeddingError::EmptyPool)));
    }

    #[tokio::test]
    async fn test_unknown_model_is_error() {
        let engine = EmbeddingEngine::new(ModelKind::Bert);
        let result = engine.embed("text", ModelKind::SciBert).await;
        assert!(matches!(result, Err(EmbeddingError::UnknownModel(_))));
    }

    #[tokio::test]
    async fn test_embed_query_uses_primary() {
        let primary = MockEncoder::new(2);
        let mut engine = EmbeddingEngine::new(ModelKind::Specter2);
        engine.register(ModelKind::Specter2, Box::new(primary.clone()));
        engine.register(ModelKind::Bert, Box::new(MockEncoder::new(5)));

        let v = engine.embed_query("a query").await.unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(primary.calls.lock().unwrap().as_slice(), ["a query".to_string()]);
    }
}
