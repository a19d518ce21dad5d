//! Ranking engine.
//!
//! Cosine ranking of researchers against a query vector, the "top paper" refinement
//! within one researcher, and topic-based ranking from accumulated affinity scores.
//! [`BruteForceMatcher`] ties these to a loaded snapshot and the embedding engine to
//! answer both request shapes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use supervisor_match::query::{BruteForceMatcher, Snapshot, SupervisorMatcher};
//! # use supervisor_match::embedding::engine::EmbeddingEngine;
//!
//! # async fn example(engine: Arc<EmbeddingEngine>, snapshot: Snapshot) -> Result<(), Box<dyn std::error::Error>> {
//! let matcher = BruteForceMatcher::new(engine, snapshot, "specter2_averaged_embedding_with_keywords");
//! for suggestion in matcher.match_specific("graph neural networks", 5).await? {
//!     println!("{} - Score: {:.3}", suggestion.supervisor_id, suggestion.similarity);
//! }
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::embedding::engine::EmbeddingEngine;
use crate::models::{Abstract, Researcher, SupervisorTopic, Topic, Vector};
use crate::storage::SupervisorStorage;

/// Errors that can occur during query processing.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    /// Storage access failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid query parameters
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// No researchers are loaded
    #[error("No researchers available to match against")]
    EmptySnapshot,
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Fit a vector to `target` elements.
///
/// Longer vectors keep their leading `target` elements. Shorter ones are repeated
/// `target / len` times and zero-padded to the exact length. This is an approximate
/// compatibility shim for comparing vectors from encoders of different widths; the
/// resulting similarities are not meaningful across models.
pub fn resize(vector: &[f32], target: usize) -> Vector {
    if vector.len() >= target {
        return vector[..target].to_vec();
    }
    if vector.is_empty() {
        return vec![0.0; target];
    }

    let mut resized = Vec::with_capacity(target);
    for _ in 0..target / vector.len() {
        resized.extend_from_slice(vector);
    }
    resized.resize(target, 0.0);
    resized
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub id: String,
    pub score: f64,
}

fn sort_descending(ranking: &mut [RankedCandidate]) {
    // `sort_by` is stable, so equal scores keep input order.
    ranking.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Rank candidates by cosine similarity to `query`, best first.
///
/// Candidates without a vector (or with an empty one) are skipped. Mismatched
/// lengths go through [`resize`]. Ties keep input order.
pub fn rank<'a, I>(query: &[f32], candidates: I) -> Vec<RankedCandidate>
where
    I: IntoIterator<Item = (&'a str, Option<&'a [f32]>)>,
{
    let mut ranking: Vec<RankedCandidate> = candidates
        .into_iter()
        .filter_map(|(id, vector)| {
            let vector = vector.filter(|v| !v.is_empty())?;
            let score = if vector.len() == query.len() {
                cosine_similarity(query, vector)
            } else {
                cosine_similarity(query, &resize(vector, query.len()))
            };
            Some(RankedCandidate {
                id: id.to_string(),
                score: score as f64,
            })
        })
        .collect();
    sort_descending(&mut ranking);
    ranking
}

/// [`rank`] followed by truncation to the best `k`.
pub fn rank_top_k<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<RankedCandidate>
where
    I: IntoIterator<Item = (&'a str, Option<&'a [f32]>)>,
{
    let mut ranking = rank(query, candidates);
    ranking.truncate(k);
    ranking
}

/// The researcher's abstract most similar to the query.
///
/// Abstracts without a vector or with a different dimension are skipped; the
/// first abstract wins ties.
pub fn top_paper<'a>(query: &[f32], abstracts: &'a [Abstract]) -> Option<&'a Abstract> {
    let mut best: Option<(&Abstract, f32)> = None;
    for abs in abstracts {
        let Some(vector) = abs.embedding.as_deref() else {
            continue;
        };
        if vector.len() != query.len() {
            continue;
        }
        let score = cosine_similarity(query, vector);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((abs, score));
        }
    }
    best.map(|(abs, _)| abs)
}

/// Rank researchers by their summed affinity over the selected topics.
///
/// Researchers appear in order of first association row; ties keep that order.
pub fn rank_by_topics(topic_ids: &[i32], rows: &[SupervisorTopic], k: usize) -> Vec<RankedCandidate> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut ranking: Vec<RankedCandidate> = Vec::new();

    for row in rows {
        let Some(topic_id) = row.topic_id else {
            continue;
        };
        if !topic_ids.contains(&topic_id) {
            continue;
        }
        match positions.get(row.uuid.as_str()) {
            Some(&index) => ranking[index].score += row.score,
            None => {
                positions.insert(row.uuid.as_str(), ranking.len());
                ranking.push(RankedCandidate {
                    id: row.uuid.clone(),
                    score: row.score,
                });
            }
        }
    }

    sort_descending(&mut ranking);
    ranking.truncate(k);
    ranking
}

/// The abstract whose topic scores sum highest over `topic_ids`; first wins ties.
pub fn best_topic_paper<'a>(abstracts: &'a [Abstract], topic_ids: &[i32]) -> Option<&'a Abstract> {
    let mut best: Option<(&Abstract, f64)> = None;
    for abs in abstracts {
        let score = abs.topic_score(topic_ids);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((abs, score));
        }
    }
    best.map(|(abs, _)| abs)
}

/// Publication reported alongside a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRef {
    pub uuid: String,
    pub title: String,
    pub url: Option<String>,
}

impl From<&Abstract> for PaperRef {
    fn from(abs: &Abstract) -> Self {
        Self {
            uuid: abs.uuid.clone(),
            title: abs.title.clone(),
            url: abs.url.clone(),
        }
    }
}

/// One ranked supervisor suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub supervisor_id: String,
    pub similarity: f64,
    pub top_paper: Option<PaperRef>,
}

/// Everything serving reads: researchers with vectors and abstracts, the topic
/// catalog and the association rows.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub researchers: Vec<Researcher>,
    pub topics: Vec<Topic>,
    pub supervisor_topics: Vec<SupervisorTopic>,
}

impl Snapshot {
    /// Load the full snapshot from storage.
    pub async fn load<S: SupervisorStorage + ?Sized>(storage: &S) -> QueryResult<Self> {
        let to_query = |e: crate::storage::StorageError| QueryError::StorageError(e.to_string());
        Ok(Self {
            researchers: storage.load_researchers().await.map_err(to_query)?,
            topics: storage.load_topics().await.map_err(to_query)?,
            supervisor_topics: storage.load_supervisor_topics().await.map_err(to_query)?,
        })
    }

    pub fn researcher(&self, uuid: &str) -> Option<&Researcher> {
        self.researchers.iter().find(|r| r.uuid == uuid)
    }
}

/// Answers both request shapes of the serving contract.
#[async_trait]
pub trait SupervisorMatcher: Send + Sync {
    /// Rank supervisors against a free-text project description.
    ///
    /// # Errors
    /// Returns `QueryError` if the text is empty, nothing is loaded, or embedding fails
    async fn match_specific(&self, text: &str, k: usize) -> QueryResult<Vec<Suggestion>>;

    /// Rank supervisors by accumulated affinity to the selected topics.
    ///
    /// # Errors
    /// Returns `QueryError` if no topics are given or nothing is loaded
    async fn match_general(&self, topic_ids: &[i32], k: usize) -> QueryResult<Vec<Suggestion>>;
}

/// In-memory matcher over a loaded snapshot.
///
/// Every call is a read-only pass over the snapshot; nothing is cached between requests.
pub struct BruteForceMatcher {
    /// Embeds query text with the primary encoder
    engine: Arc<EmbeddingEngine>,

    /// Loaded researchers and topic rows
    snapshot: Snapshot,

    /// Variant ranked against in specific mode
    variant: String,
}

impl BruteForceMatcher {
    pub fn new(engine: Arc<EmbeddingEngine>, snapshot: Snapshot, variant: impl Into<String>) -> Self {
        Self {
            engine,
            snapshot,
            variant: variant.into(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Rank against an already-embedded query vector.
    pub fn match_vector(&self, query: &[f32], k: usize) -> Vec<Suggestion> {
        let candidates = self
            .snapshot
            .researchers
            .iter()
            .map(|r| (r.uuid.as_str(), r.embedding(&self.variant)));

        rank_top_k(query, candidates, k)
            .into_iter()
            .map(|ranked| {
                let top_paper = self
                    .snapshot
                    .researcher(&ranked.id)
                    .and_then(|r| top_paper(query, &r.abstracts))
                    .map(PaperRef::from);
                Suggestion {
                    supervisor_id: ranked.id,
                    similarity: ranked.score,
                    top_paper,
                }
            })
            .collect()
    }
}

#[async_trait]
impl SupervisorMatcher for BruteForceMatcher {
    async fn match_specific(&self, text: &str, k: usize) -> QueryResult<Vec<Suggestion>> {
        if text.trim().is_empty() {
            return Err(QueryError::InvalidQuery("text must not be empty".to_string()));
        }
        if self.snapshot.researchers.is_empty() {
            return Err(QueryError::EmptySnapshot);
        }

        let query = self
            .engine
            .embed_query(text.trim())
            .await
            .map_err(|e| QueryError::EmbeddingError(e.to_string()))?;
        let suggestions = self.match_vector(&query, k);
        debug!(results = suggestions.len(), variant = %self.variant, "Specific match");
        Ok(suggestions)
    }

    async fn match_general(&self, topic_ids: &[i32], k: usize) -> QueryResult<Vec<Suggestion>> {
        if topic_ids.is_empty() {
            return Err(QueryError::InvalidQuery("at least one topic is required".to_string()));
        }
        if self.snapshot.researchers.is_empty() {
            return Err(QueryError::EmptySnapshot);
        }

        let suggestions: Vec<Suggestion> = rank_by_topics(topic_ids, &self.snapshot.supervisor_topics, k)
            .into_iter()
            .map(|ranked| {
                let top_paper = self
                    .snapshot
                    .researcher(&ranked.id)
                    .and_then(|r| best_topic_paper(&r.abstracts, topic_ids))
                    .map(PaperRef::from);
                Suggestion {
                    supervisor_id: ranked.id,
                    similarity: ranked.score,
                    top_paper,
                }
            })
            .collect();
        debug!(results = suggestions.len(), topics = topic_ids.len(), "General match");
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::engine::tests::MockEncoder;
    use crate::models::ModelKind;

    const VARIANT: &str = "specter2_averaged_embedding";

    fn abstract_with(uuid: &str, embedding: Option<Vector>) -> Abstract {
        let mut abs = Abstract::new(uuid.into(), format!("Title {}", uuid), None, "text".into());
        abs.embedding = embedding;
        abs
    }

    fn researcher_with(uuid: &str, vector: Option<Vector>, abstracts: Vec<Abstract>) -> Researcher {
        let mut r = Researcher::new(uuid);
        if let Some(v) = vector {
            r.embeddings.insert(VARIANT.to_string(), v);
        }
        r.abstracts = abstracts;
        r
    }

    #[test]
    fn test_resize_truncates_longer() {
        assert_eq!(resize(&[1.0, 2.0, 3.0, 4.0], 2), vec![1.0, 2.0]);
        assert_eq!(resize(&[1.0, 2.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_resize_tiles_and_pads_shorter() {
        let v = [1.0, 2.0, 3.0];
        let resized = resize(&v, 8);
        assert_eq!(resized, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 0.0, 0.0]);
        assert_eq!(&resized[..3], &v);

        for target in 0..20 {
            assert_eq!(resize(&v, target).len(), target);
        }
        assert_eq!(resize(&[], 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);

        let a = vec![1.0, 2.0];
        let b = vec![-1.0, -2.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_self_similarity_after_resize() {
        let v = vec![0.3, -1.2, 4.5];
        let resized = resize(&v, 7);
        assert!((cosine_similarity(&resized, &resized) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs_are_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_rank_skips_missing_and_keeps_tie_order() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let candidates = vec![
            ("first", Some(a.as_slice())),
            ("missing", None),
            ("empty", Some(&[][..])),
            ("orthogonal", Some(b.as_slice())),
            ("second", Some(a.as_slice())),
        ];
        let ranking = rank(&[2.0, 0.0], candidates);
        let ids: Vec<&str> = ranking.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "orthogonal"]);
    }

    #[test]
    fn test_rank_resizes_mismatched_candidates() {
        let short = vec![1.0, 1.0];
        let ranking = rank(&[1.0, 1.0, 1.0, 1.0], vec![("short", Some(short.as_slice()))]);
        assert_eq!(ranking.len(), 1);
        assert!((ranking[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rank_is_idempotent() {
        let vectors: Vec<Vector> = (0..10)
            .map(|i| vec![(i as f32).sin(), (i as f32).cos(), 0.5])
            .collect();
        let ids: Vec<String> = (0..10).map(|i| format!("r{}", i)).collect();
        let candidates = || {
            ids.iter()
                .map(String::as_str)
                .zip(vectors.iter().map(|v| Some(v.as_slice())))
        };
        let query = [0.2, 0.9, 0.1];
        assert_eq!(rank(&query, candidates()), rank(&query, candidates()));
    }

    #[test]
    fn test_top_k_after_full_sort() {
        let vectors = [vec![0.1, 1.0], vec![0.5, 1.0], vec![1.0, 0.0]];
        let candidates = vec![
            ("low", Some(vectors[0].as_slice())),
            ("mid", Some(vectors[1].as_slice())),
            ("best", Some(vectors[2].as_slice())),
        ];
        let ranking = rank_top_k(&[1.0, 0.0], candidates, 1);
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].id, "best");
    }

    #[test]
    fn test_end_to_end_rank_and_top_paper() {
        let query = vec![1.0, 0.0, 0.0];
        let closest = vec![0.95, 0.05, 0.0];
        let a = researcher_with(
            "A",
            Some(closest.clone()),
            vec![
                abstract_with("a-far", Some(vec![0.0, 1.0, 0.0])),
                abstract_with("a-close", Some(closest.clone())),
            ],
        );
        let b = researcher_with("B", Some(vec![0.3, 0.7, 0.0]), vec![abstract_with("b1", Some(vec![0.3, 0.7, 0.0]))]);
        let c = researcher_with("C", Some(vec![0.0, 0.0, 1.0]), vec![abstract_with("c1", Some(vec![0.0, 0.0, 1.0]))]);
        let researchers = [b, a, c];

        let ranking = rank(&query, researchers.iter().map(|r| (r.uuid.as_str(), r.embedding(VARIANT))));
        assert_eq!(ranking[0].id, "A");

        let best = top_paper(&query, &researchers[1].abstracts).unwrap();
        assert_eq!(best.uuid, "a-close");
    }

    #[test]
    fn test_top_paper_skips_mismatched_and_prefers_first_on_tie() {
        let abstracts = vec![
            abstract_with("none", None),
            abstract_with("wide", Some(vec![1.0, 0.0, 0.0, 0.0])),
            abstract_with("first", Some(vec![1.0, 1.0])),
            abstract_with("second", Some(vec![2.0, 2.0])),
        ];
        assert_eq!(top_paper(&[1.0, 1.0], &abstracts).unwrap().uuid, "first");
        assert!(top_paper(&[1.0, 1.0], &abstracts[..2]).is_none());
    }

    #[test]
    fn test_rank_by_topics_accumulates_selected_topics() {
        let rows = vec![
            SupervisorTopic::new("r1", 1, 0.5),
            SupervisorTopic::new("r2", 1, 0.9),
            SupervisorTopic::new("r1", 2, 0.6),
            SupervisorTopic::new("r3", 3, 5.0),
            SupervisorTopic { uuid: "r4".into(), topic_id: None, score: 9.0 },
        ];
        let ranking = rank_by_topics(&[1, 2], &rows, 5);
        let ids: Vec<&str> = ranking.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert!((ranking[0].score - 1.1).abs() < 1e-9);

        assert_eq!(rank_by_topics(&[1, 2], &rows, 1).len(), 1);
    }

    #[test]
    fn test_best_topic_paper_first_seen_wins_ties() {
        let mut first = abstract_with("first", None);
        first.topics.insert(1, 0.4);
        let mut second = abstract_with("second", None);
        second.topics.insert(2, 0.4);
        let mut third = abstract_with("third", None);
        third.topics.insert(3, 0.9);

        let abstracts = vec![first, second, third];
        assert_eq!(best_topic_paper(&abstracts, &[1, 2]).unwrap().uuid, "first");
        assert_eq!(best_topic_paper(&abstracts, &[2, 3]).unwrap().uuid, "third");
        assert!(best_topic_paper(&[], &[1]).is_none());
    }

    fn matcher(snapshot: Snapshot) -> BruteForceMatcher {
        let mut engine = EmbeddingEngine::new(ModelKind::Specter2);
        engine.register(ModelKind::Specter2, Box::new(MockEncoder::new(3)));
        BruteForceMatcher::new(Arc::new(engine), snapshot, VARIANT)
    }

    #[tokio::test]
    async fn test_match_specific_reports_top_paper() {
        let encoder = MockEncoder::new(3);
        let query = encoder.vector_for("robots");
        let snapshot = Snapshot {
            researchers: vec![
                researcher_with("far", Some(vec![-1.0, -1.0, -1.0]), vec![]),
                researcher_with(
                    "near",
                    Some(query.clone()),
                    vec![abstract_with("p1", Some(query.clone()))],
                ),
            ],
            ..Default::default()
        };

        let suggestions = matcher(snapshot).match_specific("robots", 5).await.unwrap();
        assert_eq!(suggestions[0].supervisor_id, "near");
        assert_eq!(suggestions[0].top_paper.as_ref().unwrap().uuid, "p1");
        assert!(suggestions[1].top_paper.is_none());
    }

    #[tokio::test]
    async fn test_match_specific_rejects_empty_text_and_snapshot() {
        let m = matcher(Snapshot::default());
        assert!(matches!(
            m.match_specific("   ", 5).await,
            Err(QueryError::InvalidQuery(_))
        ));
        assert!(matches!(
            m.match_specific("robots", 5).await,
            Err(QueryError::EmptySnapshot)
        ));
    }

    #[tokio::test]
    async fn test_match_general_uses_topic_scores() {
        let mut paper = abstract_with("p-topic", None);
        paper.topics.insert(4, 0.8);
        let snapshot = Snapshot {
            researchers: vec![
                researcher_with("r1", None, vec![paper]),
                researcher_with("r2", None, vec![]),
            ],
            topics: vec![],
            supervisor_topics: vec![
                SupervisorTopic::new("r2", 4, 0.2),
                SupervisorTopic::new("r1", 4, 0.8),
            ],
        };

        let suggestions = matcher(snapshot).match_general(&[4], 5).await.unwrap();
        assert_eq!(suggestions[0].supervisor_id, "r1");
        assert!((suggestions[0].similarity - 0.8).abs() < 1e-9);
        assert_eq!(suggestions[0].top_paper.as_ref().unwrap().uuid, "p-topic");

        let m = matcher(Snapshot::default());
        assert!(matches!(m.match_general(&[], 5).await, Err(QueryError::InvalidQuery(_))));
    }
}
