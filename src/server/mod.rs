//! Match server module.
//!
//! Implements the serving contract over loosely-typed JSON requests:
//!
//! - `{"projectType": "specific", "text": "..."}` ranks supervisors against the text
//! - `{"projectType": "general", "topics": [{"topicId": 3}, ...]}` ranks by topic affinity
//!
//! Both answer `{"results": [{supervisor_id, similarity, top_paper}, ...]}`. A
//! malformed request or a failed match answers `{"error": "..."}`; the server never
//! stops on a bad request.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::embedding::engine::EmbeddingEngine;
use crate::query::{BruteForceMatcher, Snapshot, Suggestion, SupervisorMatcher};
use crate::storage::SupervisorStorage;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Matching failed
    #[error("Match failed: {0}")]
    MatchError(String),

    /// Server initialization error
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Results returned when a request does not say.
pub const DEFAULT_RESULT_COUNT: usize = 5;

/// A validated match request.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchRequest {
    /// Free-text project description
    Specific { text: String, k: usize },

    /// Selected catalog topics
    General { topic_ids: Vec<i32>, k: usize },
}

impl MatchRequest {
    /// Validate a raw request.
    ///
    /// # Errors
    /// Returns `ServerError::InvalidRequest` for a missing or unknown `projectType`,
    /// a specific request without non-empty `text`, a general request without a
    /// `topics` list of integer `topicId`s, or a non-positive `k`
    pub fn from_value(value: &Value) -> ServerResult<Self> {
        let k = match value.get("k") {
            None | Some(Value::Null) => DEFAULT_RESULT_COUNT,
            Some(raw) => raw
                .as_u64()
                .filter(|&k| k > 0)
                .map(|k| k as usize)
                .ok_or_else(|| ServerError::InvalidRequest("k must be a positive integer".to_string()))?,
        };

        let project_type = value
            .get("projectType")
            .and_then(Value::as_str)
            .ok_or_else(|| ServerError::InvalidRequest("missing projectType".to_string()))?;

        match project_type {
            "specific" => {
                let text = value
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ServerError::InvalidRequest("specific request requires text".to_string()))?;
                Ok(Self::Specific {
                    text: text.to_string(),
                    k,
                })
            }
            "general" => {
                let topics = value
                    .get("topics")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ServerError::InvalidRequest("general request requires topics".to_string()))?;
                let topic_ids = topics
                    .iter()
                    .map(|topic| {
                        topic
                            .get("topicId")
                            .and_then(Value::as_i64)
                            .and_then(|id| i32::try_from(id).ok())
                            .ok_or_else(|| {
                                ServerError::InvalidRequest("every topic needs an integer topicId".to_string())
                            })
                    })
                    .collect::<ServerResult<Vec<i32>>>()?;
                if topic_ids.is_empty() {
                    return Err(ServerError::InvalidRequest("topics must not be empty".to_string()));
                }
                Ok(Self::General { topic_ids, k })
            }
            other => Err(ServerError::InvalidRequest(format!("unknown projectType '{}'", other))),
        }
    }
}

/// Successful response body.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    pub results: Vec<Suggestion>,
}

fn error_response(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Dispatches serving-contract requests to a matcher.
#[derive(Clone)]
pub struct MatchService {
    matcher: Arc<dyn SupervisorMatcher>,
}

impl MatchService {
    pub fn new(matcher: Arc<dyn SupervisorMatcher>) -> Self {
        Self { matcher }
    }

    /// Load the snapshot from storage and match with its serving variant.
    ///
    /// # Errors
    /// Returns `ServerError::InitializationError` if the storage holds no snapshot,
    /// or the snapshot was built with a different primary model or dimension
    pub async fn from_storage<S>(storage: &S, engine: Arc<EmbeddingEngine>) -> ServerResult<Self>
    where
        S: SupervisorStorage + ?Sized,
    {
        let init = |e: String| ServerError::InitializationError(e);
        let config = storage
            .get_config()
            .await
            .map_err(|e| init(e.to_string()))?
            .ok_or_else(|| init("storage holds no snapshot; run ingestion first".to_string()))?;

        if config.primary_model != engine.primary() {
            return Err(init(format!(
                "snapshot built with '{}' but engine uses '{}'",
                config.primary_model,
                engine.primary()
            )));
        }
        let dimension = engine.dimension(config.primary_model).map_err(|e| init(e.to_string()))?;
        if dimension != config.dimension {
            return Err(init(format!(
                "snapshot dimension {} but encoder produces {}",
                config.dimension, dimension
            )));
        }

        let snapshot = Snapshot::load(storage).await.map_err(|e| init(e.to_string()))?;
        info!(
            researchers = snapshot.researchers.len(),
            topics = snapshot.topics.len(),
            variant = %config.serving_variant,
            "Loaded snapshot"
        );
        let matcher = BruteForceMatcher::new(engine, snapshot, config.serving_variant);
        Ok(Self::new(Arc::new(matcher)))
    }

    /// Execute a validated request.
    ///
    /// # Errors
    /// Returns `ServerError::MatchError` if matching fails
    pub async fn execute(&self, request: &MatchRequest) -> ServerResult<MatchResponse> {
        let results = match request {
            MatchRequest::Specific { text, k } => self.matcher.match_specific(text, *k).await,
            MatchRequest::General { topic_ids, k } => self.matcher.match_general(topic_ids, *k).await,
        }
        .map_err(|e| ServerError::MatchError(e.to_string()))?;
        Ok(MatchResponse { results })
    }

    /// Answer one raw request; failures become `{"error": ...}`.
    pub async fn handle(&self, request: &Value) -> Value {
        let parsed = match MatchRequest::from_value(request) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Rejected request");
                return error_response(e);
            }
        };
        match self.execute(&parsed).await {
            Ok(response) => serde_json::to_value(&response).unwrap_or_else(error_response),
            Err(e) => {
                warn!(error = %e, "Request failed");
                error_response(e)
            }
        }
    }

    /// Answer one line of JSON.
    pub async fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<Value>(line) {
            Ok(request) => self.handle(&request).await,
            Err(e) => error_response(format!("Invalid request: malformed JSON: {}", e)),
        }
    }

    /// Serve newline-delimited JSON requests until `reader` is exhausted.
    ///
    /// Blank lines are ignored. Every other line gets exactly one response line.
    ///
    /// # Errors
    /// Returns an IO error if reading or writing fails
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut answered = 0;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            writer.write_all(response.to_string().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            answered += 1;
        }
        Ok(answered)
    }
}
