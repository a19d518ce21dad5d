//! Evaluation harness.
//!
//! Scores representation variants by mean reciprocal rank over proposals whose true
//! supervisor is known. Every variant is ranked against the same candidate snapshot,
//! and query vectors are computed once per encoder so variants of one model see
//! identical queries.
//!
//! A query counts toward the mean when its ranking is non-empty; if the true
//! supervisor is missing from a counted ranking it contributes 0. Queries with an
//! empty ranking are reported as skipped.

pub mod tfidf;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::embedding::engine::EmbeddingEngine;
use crate::models::{ModelKind, RepresentationVariant, Researcher, Vector};
use crate::query::{rank, RankedCandidate};

use self::tfidf::{researcher_document, TfidfIndex, BASELINE_VARIANT, MAX_FEATURES};

/// Errors that can occur during evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed proposals line
    #[error("Parse error on line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Embedding error: {0}")]
    EmbeddingError(String),
}

/// Result type for evaluation.
pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// A project proposal with its known supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub supervisor_id: String,
    pub text: String,
}

/// Read proposals from a JSON-lines file; blank lines are ignored.
///
/// # Errors
/// Returns `EvaluationError` if the file cannot be read or a line is not a proposal
pub fn load_proposals(path: &Path) -> EvaluationResult<Vec<Proposal>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| EvaluationError::ParseError {
                line: i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// MRR of one variant over a proposal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub variant: String,
    pub mrr: f64,

    /// Queries with a non-empty ranking
    pub evaluated: usize,

    /// Queries with nothing to rank
    pub skipped: usize,

    /// 1-indexed position of the true supervisor per query, `None` if absent
    pub positions: Vec<Option<usize>>,
}

/// 1-indexed position of `true_id` in `ranking`.
pub fn position_of(ranking: &[RankedCandidate], true_id: &str) -> Option<usize> {
    ranking.iter().position(|c| c.id == true_id).map(|p| p + 1)
}

/// `1 / position` of `true_id`, or 0 when it is absent.
pub fn reciprocal_rank(ranking: &[RankedCandidate], true_id: &str) -> f64 {
    position_of(ranking, true_id).map_or(0.0, |p| 1.0 / p as f64)
}

/// Build a report from one ranking per query.
pub fn summarize<'a, I>(variant: impl Into<String>, rankings: I) -> EvaluationReport
where
    I: IntoIterator<Item = (&'a str, Vec<RankedCandidate>)>,
{
    let mut positions = Vec::new();
    let mut total = 0.0;
    let mut evaluated = 0;
    let mut skipped = 0;

    for (true_id, ranking) in rankings {
        if ranking.is_empty() {
            skipped += 1;
            positions.push(None);
            continue;
        }
        evaluated += 1;
        total += reciprocal_rank(&ranking, true_id);
        positions.push(position_of(&ranking, true_id));
    }

    EvaluationReport {
        variant: variant.into(),
        mrr: if evaluated == 0 { 0.0 } else { total / evaluated as f64 },
        evaluated,
        skipped,
        positions,
    }
}

/// Evaluates variants against one fixed candidate set.
pub struct Evaluator<'a> {
    engine: &'a EmbeddingEngine,
    candidates: &'a [Researcher],
    query_cache: HashMap<ModelKind, Vec<Vector>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(engine: &'a EmbeddingEngine, candidates: &'a [Researcher]) -> Self {
        Self {
            engine,
            candidates,
            query_cache: HashMap::new(),
        }
    }

    async fn query_vectors(&mut self, proposals: &[Proposal], model: ModelKind) -> EvaluationResult<&[Vector]> {
        if !self.query_cache.contains_key(&model) {
            debug!(model = %model, queries = proposals.len(), "Embedding evaluation queries");
            let texts: Vec<&str> = proposals.iter().map(|p| p.text.as_str()).collect();
            let vectors = self
                .engine
                .embed_many(&texts, model)
                .await
                .map_err(|e| EvaluationError::EmbeddingError(e.to_string()))?;
            self.query_cache.insert(model, vectors);
        }
        Ok(self
            .query_cache
            .get(&model)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// MRR of one representation variant.
    ///
    /// # Errors
    /// Returns `EvaluationError::EmbeddingError` if the variant's encoder is not
    /// loaded or fails
    pub async fn evaluate(
        &mut self,
        proposals: &[Proposal],
        variant: &RepresentationVariant,
    ) -> EvaluationResult<EvaluationReport> {
        let name = variant.name();
        let candidates = self.candidates;
        let queries = self.query_vectors(proposals, variant.model).await?;

        let rankings: Vec<(&str, Vec<RankedCandidate>)> = proposals
            .iter()
            .zip(queries)
            .map(|(proposal, query)| {
                let ranking = rank(
                    query,
                    candidates.iter().map(|r| (r.uuid.as_str(), r.embedding(&name))),
                );
                (proposal.supervisor_id.as_str(), ranking)
            })
            .collect();

        let report = summarize(name, rankings);
        info!(
            variant = %report.variant,
            mrr = report.mrr,
            evaluated = report.evaluated,
            skipped = report.skipped,
            "Evaluated variant"
        );
        Ok(report)
    }

    /// MRR of the lexical TF-IDF baseline over concatenated abstracts.
    pub fn evaluate_tfidf(&self, proposals: &[Proposal]) -> EvaluationReport {
        let documents: Vec<String> = self.candidates.iter().map(researcher_document).collect();
        let index = TfidfIndex::fit(&documents, MAX_FEATURES);
        let vectors: Vec<Vector> = documents.iter().map(|d| index.transform(d)).collect();

        let rankings: Vec<(&str, Vec<RankedCandidate>)> = proposals
            .iter()
            .map(|proposal| {
                let query = index.transform(&proposal.text);
                let ranking = rank(
                    &query,
                    self.candidates
                        .iter()
                        .zip(&vectors)
                        .map(|(r, v)| (r.uuid.as_str(), Some(v.as_slice()))),
                );
                (proposal.supervisor_id.as_str(), ranking)
            })
            .collect();

        let report = summarize(BASELINE_VARIANT, rankings);
        info!(mrr = report.mrr, features = index.feature_count(), "Evaluated TF-IDF baseline");
        report
    }
}

/// MRR of `variant` for `queries` against `candidates`.
///
/// # Errors
/// Returns `EvaluationError::EmbeddingError` if query embedding fails
pub async fn mean_reciprocal_rank(
    engine: &EmbeddingEngine,
    queries: &[Proposal],
    candidates: &[Researcher],
    variant: &RepresentationVariant,
) -> EvaluationResult<f64> {
    let mut evaluator = Evaluator::new(engine, candidates);
    Ok(evaluator.evaluate(queries, variant).await?.mrr)
}
