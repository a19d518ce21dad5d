//! Supervisor Match - thesis supervisor recommendation over research abstracts.
//!
//! This library matches student project ideas to academic supervisors using
//! embeddings of the supervisors' published abstracts and a discovered catalog of
//! research topics.
//!
//! # Architecture
//!
//! - **normalizer**: Turns raw registry records into typed researchers and abstracts
//! - **provider**: Registry sources (paginated HTTP API, JSON snapshot files)
//! - **acquisition**: Eligibility filtering and abstract attribution
//! - **embedding**: Local encoders, masked-mean pooling and representation variants
//! - **topics**: Vocabulary, n-gram vectorizer, reduction, clustering and labeling
//! - **labeling**: Topic label generators
//! - **storage**: Snapshot persistence (SQLite-based)
//! - **query**: Cosine ranking, topic ranking and the matcher behind serving
//! - **evaluation**: Mean reciprocal rank per variant plus a TF-IDF baseline
//! - **ingestion**: Offline pipeline tying acquisition to persistence
//! - **server**: Request validation and the JSON serving contract
//!
//! # Workflow
//!
//! ## Offline Ingestion
//!
//! 1. Fetch person and research-output records from the registry
//! 2. Keep supervisors with an allowed job title and at least one abstract
//! 3. Embed abstracts with every encoder and build each representation variant
//! 4. Discover topics over per-researcher documents and associate researchers to them
//! 5. Store researchers, topics and associations in SQLite
//!
//! ## Online Matching
//!
//! 1. Receive `{"projectType": "specific", "text": ...}` or
//!    `{"projectType": "general", "topics": [...]}`
//! 2. Embed the text with the primary encoder, or look up topic affinities
//! 3. Rank supervisors and attach each one's most relevant paper
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use supervisor_match::{
//!     embedding::engine::EmbeddingEngine,
//!     query::{BruteForceMatcher, Snapshot, SupervisorMatcher},
//!     storage::sqlite::SqliteStorage,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = SqliteStorage::open("supervisors.db").await?;
//!     let snapshot = Snapshot::load(&storage).await?;
//!     let engine = Arc::new(EmbeddingEngine::from_specs(&specs, ModelKind::Specter2)?);
//!     let matcher = BruteForceMatcher::new(engine, snapshot, "specter2_averaged_embedding_with_keywords");
//!
//!     for suggestion in matcher.match_specific("graph neural networks", 5).await? {
//!         println!("{}: {:.3}", suggestion.supervisor_id, suggestion.similarity);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod acquisition;
pub mod config;
pub mod embedding;
pub mod evaluation;
pub mod ingestion;
pub mod labeling;
pub mod models;
pub mod normalizer;
pub mod provider;
pub mod query;
pub mod server;
pub mod storage;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::PipelineConfig;
pub use embedding::EmbeddingProvider;
pub use models::{Abstract, EmbeddingConfig, ModelKind, Pooling, RepresentationVariant, Researcher, Topic};
pub use query::{Suggestion, SupervisorMatcher};
pub use server::{MatchRequest, MatchService};
pub use storage::SupervisorStorage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
