//! Ingestion pipeline module.
//!
//! The scheduled batch job that rebuilds the supervisor snapshot: acquire the
//! population from the registry, build every representation variant, discover
//! topics, and persist researchers, the topic catalog and the embedding
//! configuration.
//!
//! # Usage
//!
//! ```ignore
//! use supervisor_match::ingestion::IngestionPipeline;
//! use supervisor_match::storage::sqlite::SqliteStorage;
//! use supervisor_match::provider::pure::PureClient;
//!
//! let storage = SqliteStorage::open("supervisors.db").await?;
//! let mut pipeline = IngestionPipeline::initialize_new(engine, storage, labeler, config).await?;
//!
//! let source = PureClient::new(&base_url, &api_key)?;
//! let stats = pipeline.run(&source).await?;
//! println!("Persisted: {}, Failed batches: {}", stats.persisted, stats.failed_batches);
//! ```
//!
//! Acquisition failures abort the run before anything is written. A failing
//! researcher batch is logged and skipped; the remaining batches are still written.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::acquisition::acquire;
use crate::config::PipelineConfig;
use crate::embedding::engine::EmbeddingEngine;
use crate::labeling::LabelGenerator;
use crate::models::{EmbeddingConfig, RepresentationVariant};
use crate::provider::{ProviderError, RegistrySource};
use crate::storage::SupervisorStorage;
use crate::topics::discover_topics;

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Registry access failed
    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),

    /// Topic discovery failed
    #[error("Topic error: {0}")]
    TopicError(String),

    /// Invalid configuration or input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Statistics from an ingestion run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestionStats {
    /// Eligible researchers with at least one abstract
    pub acquired: usize,

    /// Researchers written successfully
    pub persisted: usize,

    /// Upsert batches that failed and were skipped
    pub failed_batches: usize,

    /// Topics in the persisted catalog
    pub topics: usize,

    /// Association rows persisted
    pub supervisor_topics: usize,

    /// Association rows removed by validation
    pub dropped_rows: usize,

    /// Encoder inputs clipped to the context length
    pub truncated_inputs: usize,
}

impl IngestionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a written batch.
    pub fn record_batch(&mut self, size: usize) {
        self.persisted += size;
    }

    /// Record a batch that could not be written.
    pub fn record_failed_batch(&mut self) {
        self.failed_batches += 1;
    }
}

/// Callback receiving (done, total) while representations are built.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Ingestion pipeline coordinator.
pub struct IngestionPipeline<S>
where
    S: SupervisorStorage,
{
    /// Encoders for every representation variant
    engine: Arc<EmbeddingEngine>,

    /// Storage backend for the snapshot
    storage: S,

    /// Fallback topic label generator
    labeler: Box<dyn LabelGenerator>,

    config: PipelineConfig,
    variants: Vec<RepresentationVariant>,
    progress: Option<ProgressCallback>,
}

impl<S> IngestionPipeline<S>
where
    S: SupervisorStorage,
{
    fn build(
        engine: Arc<EmbeddingEngine>,
        storage: S,
        labeler: Box<dyn LabelGenerator>,
        config: PipelineConfig,
    ) -> IngestionResult<Self> {
        config
            .validate()
            .map_err(|e| IngestionError::InvalidInput(e.to_string()))?;
        let variants = config
            .representation_variants()
            .map_err(|e| IngestionError::InvalidInput(e.to_string()))?;
        if engine.primary() != config.primary_model {
            return Err(IngestionError::InvalidInput(format!(
                "engine primary model '{}' differs from configured '{}'",
                engine.primary(),
                config.primary_model
            )));
        }
        Ok(Self {
            engine,
            storage,
            labeler,
            config,
            variants,
            progress: None,
        })
    }

    /// The embedding configuration this pipeline writes.
    fn embedding_config(&self) -> IngestionResult<EmbeddingConfig> {
        let primary = self.engine.primary();
        Ok(EmbeddingConfig {
            primary_model: primary,
            dimension: self
                .engine
                .dimension(primary)
                .map_err(|e| IngestionError::EmbeddingError(e.to_string()))?,
            serving_variant: self.config.serving_variant.clone(),
            variants: self.variants.iter().map(RepresentationVariant::name).collect(),
        })
    }

    /// Initialize new storage and prepare a pipeline.
    ///
    /// Creates the schema and stores the embedding configuration.
    ///
    /// # Errors
    /// Returns `IngestionError::InvalidInput` for an invalid configuration, or
    /// `IngestionError::StorageError` if the storage cannot be initialized
    pub async fn initialize_new(
        engine: Arc<EmbeddingEngine>,
        mut storage: S,
        labeler: Box<dyn LabelGenerator>,
        config: PipelineConfig,
    ) -> IngestionResult<Self> {
        storage
            .initialize()
            .await
            .map_err(|e| IngestionError::StorageError(e.to_string()))?;
        let mut pipeline = Self::build(engine, storage, labeler, config)?;
        let embedding_config = pipeline.embedding_config()?;
        pipeline
            .storage
            .store_config(&embedding_config)
            .await
            .map_err(|e| IngestionError::StorageError(e.to_string()))?;
        Ok(pipeline)
    }

    /// Connect to storage that already holds a snapshot.
    ///
    /// # Errors
    /// Returns `IngestionError::InvalidInput` if the storage has no embedding
    /// configuration, or its primary model or dimension differs from the engine's
    pub async fn connect(
        engine: Arc<EmbeddingEngine>,
        storage: S,
        labeler: Box<dyn LabelGenerator>,
        config: PipelineConfig,
    ) -> IngestionResult<Self> {
        let stored = storage
            .get_config()
            .await
            .map_err(|e| IngestionError::StorageError(e.to_string()))?
            .ok_or_else(|| {
                IngestionError::InvalidInput(
                    "Storage has no embedding configuration. Use initialize_new() for new storage."
                        .to_string(),
                )
            })?;

        let pipeline = Self::build(engine, storage, labeler, config)?;
        let current = pipeline.embedding_config()?;
        if current.primary_model != stored.primary_model {
            return Err(IngestionError::InvalidInput(format!(
                "Embedding model mismatch: engine uses '{}' but storage has '{}'",
                current.primary_model, stored.primary_model
            )));
        }
        if current.dimension != stored.dimension {
            return Err(IngestionError::InvalidInput(format!(
                "Embedding dimension mismatch: engine has {} but storage has {}",
                current.dimension, stored.dimension
            )));
        }
        Ok(pipeline)
    }

    /// Report representation progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Run the full pipeline against a registry.
    ///
    /// # Errors
    /// * `IngestionError::ProviderError` if acquisition fails (nothing is written)
    /// * `IngestionError::EmbeddingError` / `TopicError` if representation or topic
    ///   discovery fails
    /// * `IngestionError::StorageError` if the topic catalog or configuration
    ///   cannot be written
    pub async fn run(&mut self, source: &dyn RegistrySource) -> IngestionResult<IngestionStats> {
        let population = acquire(source, &self.config.allowed_titles).await?;
        let mut researchers = population.supervisors;
        let mut stats = IngestionStats::new();
        stats.acquired = researchers.len();

        let total = researchers.len();
        for (done, researcher) in researchers.iter_mut().enumerate() {
            self.engine
                .represent(researcher, &self.variants)
                .await
                .map_err(|e| IngestionError::EmbeddingError(format!("{}: {}", researcher.uuid, e)))?;
            if let Some(progress) = &self.progress {
                progress(done + 1, total);
            }
        }
        info!(researchers = total, variants = self.variants.len(), "Built representations");

        let catalog = discover_topics(
            &mut researchers,
            &population.vocabulary,
            &self.engine,
            self.labeler.as_ref(),
            &self.config.topics,
        )
        .await
        .map_err(|e| IngestionError::TopicError(e.to_string()))?;

        for (index, batch) in researchers.chunks(self.config.batch_size).enumerate() {
            match self.storage.upsert_researchers(batch).await {
                Ok(()) => stats.record_batch(batch.len()),
                Err(e) => {
                    warn!(batch = index, size = batch.len(), error = %e, "Failed to persist researcher batch");
                    stats.record_failed_batch();
                }
            }
        }

        self.storage
            .replace_topic_catalog(&catalog.topics, &catalog.supervisor_topics)
            .await
            .map_err(|e| IngestionError::StorageError(e.to_string()))?;

        let embedding_config = self.embedding_config()?;
        self.storage
            .store_config(&embedding_config)
            .await
            .map_err(|e| IngestionError::StorageError(e.to_string()))?;

        stats.topics = catalog.topics.len();
        stats.supervisor_topics = catalog.supervisor_topics.len();
        stats.dropped_rows = catalog.dropped_rows;
        stats.truncated_inputs = self.engine.truncated_inputs();

        info!(
            acquired = stats.acquired,
            persisted = stats.persisted,
            failed_batches = stats.failed_batches,
            topics = stats.topics,
            truncated_inputs = stats.truncated_inputs,
            "Ingestion complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::tests::{output, person, titles, StaticSource};
    use crate::embedding::engine::tests::MockEncoder;
    use crate::labeling::OfflineLabeler;
    use crate::models::{ModelKind, Researcher, SupervisorTopic, Topic};
    use crate::storage::{StorageError, StorageResult};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Mock storage for testing with in-memory state.
    #[derive(Clone, Default)]
    struct MockStorage {
        state: Arc<Mutex<MockStorageState>>,
    }

    #[derive(Default)]
    struct MockStorageState {
        researchers: BTreeMap<String, Researcher>,
        topics: Vec<Topic>,
        supervisor_topics: Vec<SupervisorTopic>,
        config: Option<EmbeddingConfig>,
        initialized: bool,
        upsert_calls: usize,
        catalog_calls: usize,
        fail_on_upsert_call: Option<usize>,
    }

    impl MockStorage {
        fn new() -> Self {
            Self::default()
        }

        fn with_config(self, config: EmbeddingConfig) -> Self {
            self.state.lock().unwrap().config = Some(config);
            self
        }

        /// Fail the `n`-th upsert call (0-based).
        fn fail_upsert_call(self, n: usize) -> Self {
            self.state.lock().unwrap().fail_on_upsert_call = Some(n);
            self
        }
    }

    #[async_trait]
    impl SupervisorStorage for MockStorage {
        async fn initialize(&mut self) -> StorageResult<()> {
            self.state.lock().unwrap().initialized = true;
            Ok(())
        }

        async fn store_config(&mut self, config: &EmbeddingConfig) -> StorageResult<()> {
            self.state.lock().unwrap().config = Some(config.clone());
            Ok(())
        }

        async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>> {
            Ok(self.state.lock().unwrap().config.clone())
        }

        async fn upsert_researchers(&mut self, batch: &[Researcher]) -> StorageResult<()> {
            let mut state = self.state.lock().unwrap();
            let call = state.upsert_calls;
            state.upsert_calls += 1;
            if state.fail_on_upsert_call == Some(call) {
                return Err(StorageError::QueryError(format!("Mock failure on batch {}", call)));
            }
            for researcher in batch {
                state.researchers.insert(researcher.uuid.clone(), researcher.clone());
            }
            Ok(())
        }

        async fn replace_topic_catalog(
            &mut self,
            topics: &[Topic],
            supervisor_topics: &[SupervisorTopic],
        ) -> StorageResult<()> {
            let mut state = self.state.lock().unwrap();
            state.catalog_calls += 1;
            state.topics = topics.to_vec();
            state.supervisor_topics = supervisor_topics.to_vec();
            Ok(())
        }

        async fn load_researchers(&self) -> StorageResult<Vec<Researcher>> {
            Ok(self.state.lock().unwrap().researchers.values().cloned().collect())
        }

        async fn load_topics(&self) -> StorageResult<Vec<Topic>> {
            Ok(self.state.lock().unwrap().topics.clone())
        }

        async fn load_supervisor_topics(&self) -> StorageResult<Vec<SupervisorTopic>> {
            Ok(self.state.lock().unwrap().supervisor_topics.clone())
        }

        async fn count_researchers(&self) -> StorageResult<usize> {
            Ok(self.state.lock().unwrap().researchers.len())
        }
    }

    const DIM: usize = 6;

    fn engine() -> Arc<EmbeddingEngine> {
        let mut engine = EmbeddingEngine::new(ModelKind::Specter2);
        for kind in ModelKind::ALL {
            engine.register(kind, Box::new(MockEncoder::new(DIM)));
        }
        Arc::new(engine)
    }

    fn config(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            ..PipelineConfig::default()
        }
    }

    fn source() -> StaticSource {
        StaticSource {
            persons: vec![
                person("p-1", "Professor", &["Robotics"]),
                person("p-2", "Assistant Professor", &["Graph Theory"]),
                person("p-3", "Postdoc", &["Control"]),
                person("p-4", "Student Assistant", &["Linguistics"]),
            ],
            outputs: vec![
                output("o-1", "Robotics for walking machines.", &["p-1"]),
                output("o-2", "Graph theory of planar graphs.", &["p-2"]),
                output("o-3", "Control of robotics systems.", &["p-3", "p-1"]),
                output("o-4", "Graph theory and algorithms.", &["p-2"]),
                output("o-5", "Linguistics only.", &["p-4"]),
            ],
            fail_outputs: false,
        }
    }

    async fn pipeline(storage: MockStorage, batch_size: usize) -> IngestionPipeline<MockStorage> {
        IngestionPipeline::initialize_new(engine(), storage, Box::new(OfflineLabeler), config(batch_size))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_new_stores_config() {
        let storage = MockStorage::new();
        pipeline(storage.clone(), 5).await;

        let state = storage.state.lock().unwrap();
        assert!(state.initialized);
        let config = state.config.as_ref().unwrap();
        assert_eq!(config.primary_model, ModelKind::Specter2);
        assert_eq!(config.dimension, DIM);
        assert_eq!(config.variants.len(), 10);
        assert_eq!(config.serving_variant, "specter2_averaged_embedding_with_keywords");
    }

    #[tokio::test]
    async fn test_run_persists_snapshot() {
        let storage = MockStorage::new();
        let mut pipeline = pipeline(storage.clone(), 5).await;

        let stats = pipeline.run(&source()).await.unwrap();

        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.persisted, 3);
        assert_eq!(stats.failed_batches, 0);

        let state = storage.state.lock().unwrap();
        assert_eq!(state.researchers.len(), 3);
        assert!(!state.researchers.contains_key("p-4"));
        let p1 = &state.researchers["p-1"];
        assert_eq!(p1.embeddings.len(), 10);
        assert_eq!(p1.abstracts.len(), 2);
        assert!(p1.abstracts.iter().all(|a| a.embedding.as_ref().map(Vec::len) == Some(DIM)));
        assert_eq!(state.catalog_calls, 1);
        assert_eq!(state.topics.len(), stats.topics);
        assert_eq!(state.supervisor_topics.len(), stats.supervisor_topics);
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let storage = MockStorage::new().fail_upsert_call(0);
        let mut pipeline = pipeline(storage.clone(), 2).await;

        let stats = pipeline.run(&source()).await.unwrap();

        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.persisted, 1);
        let state = storage.state.lock().unwrap();
        assert_eq!(state.upsert_calls, 2);
        assert_eq!(state.researchers.len(), 1);
        assert_eq!(state.catalog_calls, 1);
    }

    #[tokio::test]
    async fn test_acquisition_failure_writes_nothing() {
        let storage = MockStorage::new();
        let mut pipeline = pipeline(storage.clone(), 5).await;
        let mut failing = source();
        failing.fail_outputs = true;

        let result = pipeline.run(&failing).await;

        assert!(matches!(result, Err(IngestionError::ProviderError(_))));
        let state = storage.state.lock().unwrap();
        assert_eq!(state.upsert_calls, 0);
        assert_eq!(state.catalog_calls, 0);
    }

    #[tokio::test]
    async fn test_progress_reported_per_researcher() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let mut pipeline = pipeline(MockStorage::new(), 5)
            .await
            .with_progress(Box::new(move |done, total| recorder.lock().unwrap().push((done, total))));

        pipeline.run(&source()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_connect_with_missing_config() {
        let result =
            IngestionPipeline::connect(engine(), MockStorage::new(), Box::new(OfflineLabeler), config(5)).await;
        assert!(matches!(result, Err(IngestionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_connect_with_dimension_mismatch() {
        let storage = MockStorage::new().with_config(EmbeddingConfig {
            primary_model: ModelKind::Specter2,
            dimension: 768,
            serving_variant: "specter2_averaged_embedding_with_keywords".to_string(),
            variants: vec![],
        });
        let result = IngestionPipeline::connect(engine(), storage, Box::new(OfflineLabeler), config(5)).await;

        match result {
            Err(IngestionError::InvalidInput(msg)) => assert!(msg.contains("dimension mismatch")),
            _ => panic!("Expected InvalidInput error"),
        }
    }

    #[tokio::test]
    async fn test_connect_with_matching_config() {
        let storage = MockStorage::new().with_config(EmbeddingConfig {
            primary_model: ModelKind::Specter2,
            dimension: DIM,
            serving_variant: "specter2_averaged_embedding_with_keywords".to_string(),
            variants: vec![],
        });
        let pipeline = IngestionPipeline::connect(engine(), storage, Box::new(OfflineLabeler), config(5)).await;
        assert!(pipeline.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = IngestionPipeline::initialize_new(
            engine(),
            MockStorage::new(),
            Box::new(OfflineLabeler),
            config(0),
        )
        .await;
        assert!(matches!(result, Err(IngestionError::InvalidInput(_))));
    }

    #[test]
    fn test_stats_tracking() {
        let mut stats = IngestionStats::new();
        stats.record_batch(5);
        stats.record_failed_batch();
        stats.record_batch(2);
        assert_eq!(stats.persisted, 7);
        assert_eq!(stats.failed_batches, 1);
    }

    #[test]
    fn test_acquisition_titles_helper_matches_default_config() {
        assert_eq!(titles(), PipelineConfig::default().allowed_titles);
    }
}
