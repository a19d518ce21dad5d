//! Storage layer abstraction and implementations.
//!
//! This module defines the interface for persisting and retrieving the supervisor
//! snapshot: researchers with their vectors and abstracts, the topic catalog and the
//! researcher-topic association rows. The abstraction allows for different storage
//! backends while maintaining a consistent API.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EmbeddingConfig, Researcher, SupervisorTopic, Topic};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution failed: {0}")]
    QueryError(String),

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Schema or migration error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// A row violates a catalog invariant
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for snapshot storage backends.
#[async_trait]
pub trait SupervisorStorage: Send + Sync {
    /// Initialize the storage (create tables, indexes, etc.).
    ///
    /// This should be idempotent and safe to call multiple times.
    ///
    /// # Errors
    /// Returns `StorageError` if initialization fails
    async fn initialize(&mut self) -> StorageResult<()>;

    /// Store the embedding configuration the snapshot was built with.
    ///
    /// # Errors
    /// Returns `StorageError` if storage fails
    async fn store_config(&mut self, config: &EmbeddingConfig) -> StorageResult<()>;

    /// Retrieve the embedding configuration, or `None` if no snapshot was written.
    ///
    /// # Errors
    /// Returns `StorageError` if retrieval fails
    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>>;

    /// Upsert one batch of researchers keyed by uuid.
    ///
    /// A researcher's vectors and abstracts are replaced wholesale. The batch is
    /// applied atomically: on error none of it is written.
    ///
    /// # Errors
    /// Returns `StorageError` if the batch cannot be written
    async fn upsert_researchers(&mut self, batch: &[Researcher]) -> StorageResult<()>;

    /// Replace the topic catalog and every association row.
    ///
    /// Association rows are deleted first, then topics; the new catalog is inserted
    /// before the new rows.
    ///
    /// # Errors
    /// Returns `StorageError` on a duplicate label, a duplicate (uuid, topic) pair,
    /// a row referencing an unknown topic, or any database failure
    async fn replace_topic_catalog(
        &mut self,
        topics: &[Topic],
        supervisor_topics: &[SupervisorTopic],
    ) -> StorageResult<()>;

    /// Load every researcher with vectors and abstracts, in insertion order.
    ///
    /// # Errors
    /// Returns `StorageError` if retrieval fails
    async fn load_researchers(&self) -> StorageResult<Vec<Researcher>>;

    /// Load the topic catalog ordered by topic id.
    ///
    /// # Errors
    /// Returns `StorageError` if retrieval fails
    async fn load_topics(&self) -> StorageResult<Vec<Topic>>;

    /// Load every association row.
    ///
    /// # Errors
    /// Returns `StorageError` if retrieval fails
    async fn load_supervisor_topics(&self) -> StorageResult<Vec<SupervisorTopic>>;

    /// Get the number of researchers stored.
    ///
    /// # Errors
    /// Returns `StorageError` if the count fails
    async fn count_researchers(&self) -> StorageResult<usize>;
}
