//! Core data models for the supervisor matching system.
//!
//! This module contains the fundamental data structures used across the application,
//! including researcher profiles, their abstracts, discovered topics and the
//! researcher-topic association rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A dense embedding vector.
///
/// Within one named representation variant every vector has the encoder's hidden
/// dimension. Vectors are never mutated after creation, only replaced.
pub type Vector = Vec<f32>;

/// Topic id reserved by the clustering step for noise documents.
pub const NOISE_TOPIC: i32 = -1;

/// A single publication abstract owned by exactly one researcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Abstract {
    /// Registry uuid of the research output
    pub uuid: String,

    /// Publication title
    pub title: String,

    /// Public portal URL of the publication
    #[serde(default)]
    pub url: Option<String>,

    /// Raw English abstract text
    pub text: String,

    /// Abstract vector computed by the primary encoder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vector>,

    /// Soft topic membership (topic id -> score), filled by topic discovery
    #[serde(default)]
    pub topics: BTreeMap<i32, f64>,
}

impl Abstract {
    /// Create an abstract without embedding or topic scores.
    pub fn new(uuid: String, title: String, url: Option<String>, text: String) -> Self {
        Self {
            uuid,
            title,
            url,
            text,
            embedding: None,
            topics: BTreeMap::new(),
        }
    }

    /// Sum of this abstract's topic scores over the given topic ids.
    pub fn topic_score(&self, topic_ids: &[i32]) -> f64 {
        topic_ids
            .iter()
            .filter_map(|id| self.topics.get(id))
            .sum()
    }
}

/// A researcher eligible to supervise, as stored in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Researcher {
    /// Stable registry uuid (upsert key)
    pub uuid: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// First email found across organisational associations
    #[serde(default)]
    pub email: Option<String>,

    /// Lower-cased, trimmed, de-duplicated free keywords
    #[serde(default)]
    pub keywords: BTreeSet<String>,

    /// Abstracts in registry order
    #[serde(default)]
    pub abstracts: Vec<Abstract>,

    /// Researcher-level vectors keyed by representation variant name
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vector>,

    /// Selected topic ids, best first
    #[serde(default)]
    pub topic_ids: Vec<i32>,
}

impl Researcher {
    /// Create a researcher with no abstracts or vectors.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: None,
            email: None,
            keywords: BTreeSet::new(),
            abstracts: Vec::new(),
            embeddings: BTreeMap::new(),
            topic_ids: Vec::new(),
        }
    }

    /// Keywords joined into one space-separated text, or `None` when there are none.
    pub fn keyword_text(&self) -> Option<String> {
        if self.keywords.is_empty() {
            None
        } else {
            Some(
                self.keywords
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    /// Vector stored for a representation variant, if any.
    pub fn embedding(&self, variant: &str) -> Option<&[f32]> {
        self.embeddings.get(variant).map(Vec::as_slice)
    }
}

/// A discovered research topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    /// Clustering id, never `NOISE_TOPIC`; not stable across runs
    pub topic_id: i32,

    /// Human-readable label, unique within a catalog
    pub label: String,

    /// Top representative vocabulary terms, best first
    pub keywords: Vec<String>,
}

/// Association between a researcher and a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorTopic {
    /// Researcher uuid
    pub uuid: String,

    /// Topic id; rows without one are dropped before persistence
    pub topic_id: Option<i32>,

    /// Accumulated membership probability
    pub score: f64,
}

impl SupervisorTopic {
    pub fn new(uuid: impl Into<String>, topic_id: i32, score: f64) -> Self {
        Self {
            uuid: uuid.into(),
            topic_id: Some(topic_id),
            score,
        }
    }
}

/// Encoder families a representation can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    ModernBert,
    Bert,
    SciBert,
    Specter2,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::ModernBert,
        ModelKind::Bert,
        ModelKind::SciBert,
        ModelKind::Specter2,
    ];

    /// Short key used in variant names.
    pub fn key(&self) -> &'static str {
        match self {
            ModelKind::ModernBert => "modernbert",
            ModelKind::Bert => "bert",
            ModelKind::SciBert => "scibert",
            ModelKind::Specter2 => "specter2",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.key() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown model kind '{}'", s))
    }
}

/// How a researcher's abstracts are pooled into one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// Join all abstract texts and embed once
    Concatenated,
    /// Embed each abstract and average the vectors
    Averaged,
}

impl Pooling {
    pub fn key(&self) -> &'static str {
        match self {
            Pooling::Concatenated => "concatenated",
            Pooling::Averaged => "averaged",
        }
    }
}

/// A named researcher-level representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepresentationVariant {
    pub model: ModelKind,
    pub pooling: Pooling,
    pub with_keywords: bool,
}

impl RepresentationVariant {
    pub fn new(model: ModelKind, pooling: Pooling, with_keywords: bool) -> Self {
        Self {
            model,
            pooling,
            with_keywords,
        }
    }

    /// Canonical persisted name, e.g. `specter2_averaged_embedding_with_keywords`.
    pub fn name(&self) -> String {
        let suffix = if self.with_keywords { "_with_keywords" } else { "" };
        format!("{}_{}_embedding{}", self.model.key(), self.pooling.key(), suffix)
    }

    /// The ten variants persisted by a default pipeline run.
    pub fn defaults() -> Vec<RepresentationVariant> {
        let mut variants = Vec::new();
        for pooling in [Pooling::Concatenated, Pooling::Averaged] {
            for with_keywords in [false, true] {
                variants.push(Self::new(ModelKind::ModernBert, pooling, with_keywords));
            }
        }
        for model in [ModelKind::Bert, ModelKind::SciBert, ModelKind::Specter2] {
            for with_keywords in [false, true] {
                variants.push(Self::new(model, Pooling::Averaged, with_keywords));
            }
        }
        variants
    }
}

impl fmt::Display for RepresentationVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for RepresentationVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, with_keywords) = match s.strip_suffix("_with_keywords") {
            Some(body) => (body, true),
            None => (s, false),
        };
        let body = body
            .strip_suffix("_embedding")
            .ok_or_else(|| format!("variant '{}' must end in _embedding[_with_keywords]", s))?;
        let (model, pooling) = body
            .rsplit_once('_')
            .ok_or_else(|| format!("variant '{}' is missing a pooling strategy", s))?;
        let pooling = match pooling {
            "concatenated" => Pooling::Concatenated,
            "averaged" => Pooling::Averaged,
            other => return Err(format!("unknown pooling strategy '{}'", other)),
        };
        Ok(Self::new(model.parse()?, pooling, with_keywords))
    }
}

/// Configuration of the embeddings a snapshot was built with.
///
/// Stored alongside the snapshot so serving and evaluation embed queries with the
/// same encoder that produced the abstract vectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Encoder used for abstracts, topic documents and queries
    pub primary_model: ModelKind,

    /// Hidden dimension of the primary encoder
    pub dimension: usize,

    /// Variant ranked against in specific-project requests
    pub serving_variant: String,

    /// Every variant persisted in the snapshot
    pub variants: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_names_round_trip_through_from_str() {
        for variant in RepresentationVariant::defaults() {
            let parsed: RepresentationVariant = variant.name().parse().unwrap();
            assert_eq!(parsed, variant);
        }
    }

    #[test]
    fn test_variant_name_format() {
        let variant = RepresentationVariant::new(ModelKind::Specter2, Pooling::Averaged, true);
        assert_eq!(variant.name(), "specter2_averaged_embedding_with_keywords");

        let variant = RepresentationVariant::new(ModelKind::ModernBert, Pooling::Concatenated, false);
        assert_eq!(variant.name(), "modernbert_concatenated_embedding");
    }

    #[test]
    fn test_defaults_cover_ten_variants() {
        let defaults = RepresentationVariant::defaults();
        assert_eq!(defaults.len(), 10);
        assert_eq!(
            defaults
                .iter()
                .filter(|v| v.pooling == Pooling::Concatenated)
                .count(),
            2
        );
    }

    #[test]
    fn test_invalid_variant_names() {
        assert!("specter2_averaged".parse::<RepresentationVariant>().is_err());
        assert!("gpt_averaged_embedding".parse::<RepresentationVariant>().is_err());
        assert!("bert_summed_embedding".parse::<RepresentationVariant>().is_err());
    }

    #[test]
    fn test_keyword_text() {
        let mut researcher = Researcher::new("r1");
        assert_eq!(researcher.keyword_text(), None);

        researcher.keywords.insert("robotics".to_string());
        researcher.keywords.insert("machine learning".to_string());
        assert_eq!(
            researcher.keyword_text().as_deref(),
            Some("machine learning robotics")
        );
    }

    #[test]
    fn test_abstract_topic_score() {
        let mut abs = Abstract::new("a".into(), "t".into(), None, "text".into());
        abs.topics.insert(0, 0.25);
        abs.topics.insert(3, 0.5);
        assert!((abs.topic_score(&[0, 3, 7]) - 0.75).abs() < 1e-12);
        assert_eq!(abs.topic_score(&[9]), 0.0);
    }
}
