//! Registry provider module.
//!
//! This module defines the interface for sourcing raw person and research-output
//! records from an academic registry, with an HTTP client and a snapshot-file source.
//!
//! The `RegistrySource` trait abstracts where records come from so the acquisition
//! step works the same against the live registry and against a saved snapshot.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod json;
pub mod pure;

/// Errors that can occur when fetching records from a registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Failed to read from the data source
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the data format
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The registry answered with a non-success status
    #[error("Registry returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Network or connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Source of raw registry records.
///
/// # Design Notes
///
/// - Records are returned untyped; only the normalizer interprets them
/// - Sources handle their own pagination
/// - Any failure is returned, never swallowed: acquisition aborts on it
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Fetch every person record, in registry order.
    ///
    /// # Errors
    /// Returns `ProviderError` if records cannot be fetched or parsed
    async fn fetch_persons(&self) -> ProviderResult<Vec<Value>>;

    /// Fetch every research-output record, in registry order.
    ///
    /// # Errors
    /// Returns `ProviderError` if records cannot be fetched or parsed
    async fn fetch_research_outputs(&self) -> ProviderResult<Vec<Value>>;

    /// Get a human-readable name/description of this source.
    fn name(&self) -> &str;
}
