//! Topic label generation.
//!
//! External text generation is only used when none of a topic's own keywords is
//! free to serve as its label. Callers treat every error as "no label" and fall
//! back to a synthetic one.

pub mod openai;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while generating a label.
#[derive(Debug, Error)]
pub enum LabelError {
    /// Network or transport failure
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Unreadable or empty response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Client misconfiguration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No generator is configured
    #[error("Label generation unavailable")]
    Unavailable,
}

/// Result type for label generation.
pub type LabelResult<T> = Result<T, LabelError>;

/// Produces a short label for a keyword cluster.
#[async_trait]
pub trait LabelGenerator: Send + Sync {
    /// Generate a label for `keywords` that is not in `used`.
    ///
    /// # Errors
    /// Returns `LabelError` if no label could be produced
    async fn generate(&self, keywords: &[String], used: &BTreeSet<String>) -> LabelResult<String>;

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Generator for runs without a text-generation backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineLabeler;

#[async_trait]
impl LabelGenerator for OfflineLabeler {
    async fn generate(&self, _keywords: &[String], _used: &BTreeSet<String>) -> LabelResult<String> {
        Err(LabelError::Unavailable)
    }

    fn name(&self) -> &str {
        "offline"
    }
}
