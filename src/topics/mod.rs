//! Topic discovery over the supervisors' abstracts.
//!
//! Every abstract is one document. Documents are embedded with the primary encoder,
//! reduced, clustered and described by class-based TF-IDF keywords drawn from the
//! population's keyword vocabulary. Each researcher keeps their strongest topics.

pub mod catalog;
pub mod cluster;
pub mod reduce;
pub mod vectorizer;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::TopicConfig;
use crate::embedding::engine::EmbeddingEngine;
use crate::labeling::LabelGenerator;
use crate::models::{Researcher, SupervisorTopic, Topic, Vector, NOISE_TOPIC};

use self::catalog::{assign_label, deduplicate_topics, ensure_unique_labels, validate_supervisor_topics};
use self::cluster::{hdbscan, Clustering};
use self::reduce::{reduce, ReductionParams};
use self::vectorizer::CountVectorizer;

/// Errors that can occur during topic discovery.
#[derive(Debug, Error)]
pub enum TopicError {
    /// Document embedding failed
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    /// Document vectors of different lengths
    #[error("Document vector has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result type for topic discovery.
pub type TopicResult<T> = Result<T, TopicError>;

/// Outcome of one discovery run, ready to persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicCatalog {
    /// Deduplicated topics with unique labels
    pub topics: Vec<Topic>,

    /// Validated association rows
    pub supervisor_topics: Vec<SupervisorTopic>,

    /// Rows removed by validation
    pub dropped_rows: usize,

    /// Documents the clustering left as noise
    pub noise_documents: usize,
}

/// Location of one document: (researcher index, abstract index).
type DocRef = (usize, usize);

/// Discover topics and attach them to `researchers`.
///
/// Fills each abstract's topic-score map and each researcher's `topic_ids`, and
/// returns the catalog with its association rows.
///
/// # Arguments
/// * `researchers` - Supervisors with abstracts; abstract vectors are reused when present
/// * `vocabulary` - Keywords of the whole population
/// * `engine` - Embedding engine; its primary encoder embeds missing documents
/// * `labeler` - Fallback label generator
/// * `config` - Topic parameters
///
/// # Errors
/// Returns `TopicError` if document embedding fails
pub async fn discover_topics(
    researchers: &mut [Researcher],
    vocabulary: &BTreeSet<String>,
    engine: &EmbeddingEngine,
    labeler: &dyn LabelGenerator,
    config: &TopicConfig,
) -> TopicResult<TopicCatalog> {
    let docs: Vec<DocRef> = researchers
        .iter()
        .enumerate()
        .flat_map(|(r, researcher)| (0..researcher.abstracts.len()).map(move |a| (r, a)))
        .collect();
    if docs.is_empty() {
        info!("No documents for topic discovery");
        return Ok(TopicCatalog::default());
    }

    let vectors = document_vectors(researchers, &docs, engine).await?;
    let n = docs.len();

    let reduced = reduce(
        &vectors,
        &ReductionParams {
            n_neighbors: config.neighbors_for(n),
            n_components: config.n_components,
            epochs: config.epochs,
            seed: config.seed,
        },
    );
    let clustering = hdbscan(&reduced, config.min_cluster_size_for(n), config.min_samples);
    let n_topics = clustering.cluster_count();
    let noise_documents = clustering.labels.iter().filter(|&&l| l == NOISE_TOPIC).count();
    info!(documents = n, topics = n_topics, noise = noise_documents, "Clustered documents");

    let memberships = membership_shares(&reduced, &clustering, n_topics);
    for (&(r, a), shares) in docs.iter().zip(memberships) {
        researchers[r].abstracts[a].topics = shares;
    }

    let vectorizer = CountVectorizer::new(vocabulary, config.ngram_max);
    let mut classes: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n_topics];
    for (&(r, a), &label) in docs.iter().zip(&clustering.labels) {
        let Ok(topic) = usize::try_from(label) else { continue };
        for (column, count) in vectorizer.count(&researchers[r].abstracts[a].text) {
            *classes[topic].entry(column).or_insert(0.0) += count;
        }
    }
    let keywords = vectorizer.class_keywords(&classes, config.keywords_per_topic);

    let rows = select_researcher_topics(researchers, &docs, &clustering, config.top_topics_per_researcher);

    let mut used = BTreeSet::new();
    let mut topics = Vec::with_capacity(n_topics);
    for (id, topic_keywords) in keywords.into_iter().enumerate() {
        let topic_id = id as i32;
        let (label, updated) = assign_label(topic_id, &topic_keywords, used, labeler).await;
        used = updated;
        topics.push(Topic {
            topic_id,
            label,
            keywords: topic_keywords,
        });
    }

    let outcome = deduplicate_topics(topics, rows);
    if !outcome.remap.is_empty() {
        apply_remap(researchers, &outcome.remap);
    }
    let mut topics = outcome.topics;
    ensure_unique_labels(&mut topics, labeler).await;
    let (supervisor_topics, dropped_rows) = validate_supervisor_topics(outcome.supervisor_topics, &topics);

    info!(
        topics = topics.len(),
        merged = outcome.remap.len(),
        rows = supervisor_topics.len(),
        dropped_rows,
        "Topic catalog ready"
    );
    Ok(TopicCatalog {
        topics,
        supervisor_topics,
        dropped_rows,
        noise_documents,
    })
}

/// Primary-encoder vector of every document, embedding the ones without a usable vector.
async fn document_vectors(
    researchers: &mut [Researcher],
    docs: &[DocRef],
    engine: &EmbeddingEngine,
) -> TopicResult<Vec<Vector>> {
    let primary = engine.primary();
    let dimension = engine
        .dimension(primary)
        .map_err(|e| TopicError::EmbeddingError(e.to_string()))?;

    let missing: Vec<DocRef> = docs
        .iter()
        .copied()
        .filter(|&(r, a)| {
            researchers[r].abstracts[a]
                .embedding
                .as_ref()
                .map_or(true, |v| v.len() != dimension)
        })
        .collect();

    if !missing.is_empty() {
        debug!(documents = missing.len(), model = %primary, "Embedding documents without vectors");
        let texts: Vec<&str> = missing
            .iter()
            .map(|&(r, a)| researchers[r].abstracts[a].text.as_str())
            .collect();
        let embedded = engine
            .embed_many(&texts, primary)
            .await
            .map_err(|e| TopicError::EmbeddingError(e.to_string()))?;
        for (&(r, a), vector) in missing.iter().zip(embedded) {
            researchers[r].abstracts[a].embedding = Some(vector);
        }
    }

    docs.iter()
        .map(|&(r, a)| {
            let vector = researchers[r].abstracts[a].embedding.clone().unwrap_or_default();
            if vector.len() == dimension {
                Ok(vector)
            } else {
                Err(TopicError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                })
            }
        })
        .collect()
}

/// Soft membership of every document over all topics.
///
/// Inverse distances to topic centroids, normalised to sum to the document's
/// membership probability. Noise documents get all-zero rows.
fn membership_shares(points: &[Vec<f64>], clustering: &Clustering, n_topics: usize) -> Vec<BTreeMap<i32, f64>> {
    let dim = points.first().map(Vec::len).unwrap_or(0);
    let mut centroids = vec![vec![0.0; dim]; n_topics];
    let mut sizes = vec![0usize; n_topics];
    for (point, &label) in points.iter().zip(&clustering.labels) {
        let Ok(topic) = usize::try_from(label) else { continue };
        sizes[topic] += 1;
        for (c, x) in centroids[topic].iter_mut().zip(point) {
            *c += x;
        }
    }
    for (centroid, &size) in centroids.iter_mut().zip(&sizes) {
        if size > 0 {
            centroid.iter_mut().for_each(|c| *c /= size as f64);
        }
    }

    points
        .iter()
        .zip(clustering.labels.iter().zip(&clustering.probabilities))
        .map(|(point, (&label, &probability))| {
            if label == NOISE_TOPIC {
                return (0..n_topics).map(|t| (t as i32, 0.0)).collect();
            }
            let inverse: Vec<f64> = centroids
                .iter()
                .map(|centroid| {
                    let d = point
                        .iter()
                        .zip(centroid)
                        .map(|(x, c)| (x - c).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    1.0 / d.max(1e-12)
                })
                .collect();
            let total: f64 = inverse.iter().sum();
            inverse
                .into_iter()
                .enumerate()
                .map(|(t, w)| (t as i32, w / total * probability))
                .collect()
        })
        .collect()
}

/// Accumulate affinities and keep each researcher's strongest topics.
///
/// Sets `topic_ids` on every researcher and returns the matching rows.
fn select_researcher_topics(
    researchers: &mut [Researcher],
    docs: &[DocRef],
    clustering: &Clustering,
    per_researcher: usize,
) -> Vec<SupervisorTopic> {
    let mut affinity: Vec<BTreeMap<i32, f64>> = vec![BTreeMap::new(); researchers.len()];
    for ((r, _), (&label, &probability)) in docs
        .iter()
        .zip(clustering.labels.iter().zip(&clustering.probabilities))
    {
        if label == NOISE_TOPIC {
            continue;
        }
        *affinity[*r].entry(label).or_insert(0.0) += probability;
    }

    let mut rows = Vec::new();
    for (researcher, scores) in researchers.iter_mut().zip(affinity) {
        // BTreeMap order makes the stable sort break ties by topic id.
        let mut ranked: Vec<(i32, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(per_researcher);

        researcher.topic_ids = ranked.iter().map(|(id, _)| *id).collect();
        rows.extend(
            ranked
                .into_iter()
                .map(|(id, score)| SupervisorTopic::new(researcher.uuid.clone(), id, score)),
        );
    }
    rows
}

/// Point researcher topic lists and abstract score maps at surviving topic ids.
fn apply_remap(researchers: &mut [Researcher], remap: &BTreeMap<i32, i32>) {
    for researcher in researchers.iter_mut() {
        let mut seen = BTreeSet::new();
        researcher.topic_ids = researcher
            .topic_ids
            .iter()
            .map(|id| remap.get(id).copied().unwrap_or(*id))
            .filter(|id| seen.insert(*id))
            .collect();

        for abs in researcher.abstracts.iter_mut() {
            let mut merged = BTreeMap::new();
            for (&id, &score) in &abs.topics {
                let target = remap.get(&id).copied().unwrap_or(id);
                *merged.entry(target).or_insert(0.0) += score;
            }
            abs.topics = merged;
        }
    }
}
