//! Topic labels, catalog deduplication and association-row validation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::labeling::LabelGenerator;
use crate::models::{SupervisorTopic, Topic};

/// Upper-case the first letter of every word.
pub fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn synthetic_label(topic_id: i32) -> String {
    format!("topic_{}", topic_id)
}

/// Pick a label for one topic and return it with the updated used-label set.
///
/// The first keyword (title-cased) not yet used wins. When every keyword is taken the
/// generator is asked for a fresh label; if it fails, or returns a taken or empty
/// label, the topic is labelled `topic_<id>`.
pub async fn assign_label(
    topic_id: i32,
    keywords: &[String],
    mut used: BTreeSet<String>,
    generator: &dyn LabelGenerator,
) -> (String, BTreeSet<String>) {
    if let Some(label) = keywords
        .iter()
        .map(|k| title_case(k))
        .find(|candidate| !candidate.is_empty() && !used.contains(candidate))
    {
        used.insert(label.clone());
        return (label, used);
    }

    let label = if keywords.is_empty() {
        debug!(topic_id, "Topic has no keywords");
        synthetic_label(topic_id)
    } else {
        generated_or_synthetic(topic_id, keywords, &used, generator).await
    };
    used.insert(label.clone());
    (label, used)
}

async fn generated_or_synthetic(
    topic_id: i32,
    keywords: &[String],
    used: &BTreeSet<String>,
    generator: &dyn LabelGenerator,
) -> String {
    match generator.generate(keywords, used).await {
        Ok(label) if !label.trim().is_empty() && !used.contains(label.trim()) => label.trim().to_string(),
        Ok(label) => {
            warn!(topic_id, label = %label, generator = generator.name(), "Generated label unusable, using synthetic label");
            synthetic_label(topic_id)
        }
        Err(e) => {
            warn!(topic_id, error = %e, generator = generator.name(), "Label generation failed, using synthetic label");
            synthetic_label(topic_id)
        }
    }
}

/// Collapse rows sharing a (uuid, topic) pair, keeping the highest score.
///
/// Surviving rows keep the position of the pair's first occurrence.
pub fn unique_pairs(rows: Vec<SupervisorTopic>) -> Vec<SupervisorTopic> {
    let mut position: HashMap<(String, Option<i32>), usize> = HashMap::new();
    let mut kept: Vec<SupervisorTopic> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = (row.uuid.clone(), row.topic_id);
        match position.get(&key) {
            Some(&i) => {
                if row.score > kept[i].score {
                    kept[i].score = row.score;
                }
            }
            None => {
                position.insert(key, kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

/// Catalog after deduplication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub topics: Vec<Topic>,
    pub supervisor_topics: Vec<SupervisorTopic>,

    /// Discarded topic id -> surviving topic id
    pub remap: BTreeMap<i32, i32>,
}

/// Merge topics with identical (label, keywords) signatures.
///
/// The first topic with a signature survives. Every row referencing a discarded id
/// is pointed at the survivor, then rows are collapsed with [`unique_pairs`].
pub fn deduplicate_topics(topics: Vec<Topic>, rows: Vec<SupervisorTopic>) -> DedupOutcome {
    let mut survivors: HashMap<(String, Vec<String>), i32> = HashMap::new();
    let mut remap = BTreeMap::new();
    let mut kept = Vec::with_capacity(topics.len());

    for topic in topics {
        let signature = (topic.label.clone(), topic.keywords.clone());
        match survivors.get(&signature) {
            Some(&survivor) => {
                debug!(discarded = topic.topic_id, survivor, label = %topic.label, "Merging duplicate topic");
                remap.insert(topic.topic_id, survivor);
            }
            None => {
                survivors.insert(signature, topic.topic_id);
                kept.push(topic);
            }
        }
    }

    let rows = rows
        .into_iter()
        .map(|mut row| {
            if let Some(id) = row.topic_id {
                row.topic_id = Some(remap.get(&id).copied().unwrap_or(id));
            }
            row
        })
        .collect();

    DedupOutcome {
        topics: kept,
        supervisor_topics: unique_pairs(rows),
        remap,
    }
}

/// Relabel topics whose label is empty or repeats an earlier topic's label.
pub async fn ensure_unique_labels(topics: &mut [Topic], generator: &dyn LabelGenerator) {
    let mut used: BTreeSet<String> = BTreeSet::new();
    for topic in topics.iter_mut() {
        if topic.label.trim().is_empty() || used.contains(&topic.label) {
            let label = generated_or_synthetic(topic.topic_id, &topic.keywords, &used, generator).await;
            warn!(topic_id = topic.topic_id, old = %topic.label, new = %label, "Relabelled repeated topic label");
            topic.label = label;
        }
        used.insert(topic.label.clone());
    }
}

/// Keep rows with a finite score and a topic id present in the catalog.
///
/// Returns the valid rows and the number dropped.
pub fn validate_supervisor_topics(rows: Vec<SupervisorTopic>, topics: &[Topic]) -> (Vec<SupervisorTopic>, usize) {
    let known: HashSet<i32> = topics.iter().map(|t| t.topic_id).collect();
    let total = rows.len();
    let valid: Vec<SupervisorTopic> = rows
        .into_iter()
        .filter(|row| {
            let reason = match row.topic_id {
                _ if !row.score.is_finite() => Some("non-finite score"),
                None => Some("missing topic id"),
                Some(id) if !known.contains(&id) => Some("unknown topic id"),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                warn!(uuid = %row.uuid, topic_id = ?row.topic_id, score = row.score, reason, "Dropping invalid supervisor topic");
            }
            reason.is_none()
        })
        .collect();
    let dropped = total - valid.len();
    (valid, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::tests::ScriptedLabeler;
    use crate::labeling::LabelError;

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn topic(id: i32, label: &str, keywords: &[&str]) -> Topic {
        Topic {
            topic_id: id,
            label: label.to_string(),
            keywords: words(keywords),
        }
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("machine  learning"), "Machine Learning");
        assert_eq!(title_case("eHealth"), "EHealth");
        assert_eq!(title_case(""), "");
    }

    #[tokio::test]
    async fn test_assign_label_first_free_keyword() {
        let labeler = ScriptedLabeler::new(vec![]);
        let used: BTreeSet<String> = ["Robotics".to_string()].into_iter().collect();

        let (label, used) = assign_label(3, &words(&["robotics", "control theory"]), used, &labeler).await;

        assert_eq!(label, "Control Theory");
        assert!(used.contains("Control Theory"));
        assert!(used.contains("Robotics"));
        assert_eq!(labeler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_assign_label_uses_generator_when_all_taken() {
        let labeler = ScriptedLabeler::new(vec![Ok("Autonomous Systems".to_string())]);
        let used: BTreeSet<String> = ["Robotics".to_string()].into_iter().collect();

        let (label, used) = assign_label(1, &words(&["robotics"]), used, &labeler).await;

        assert_eq!(label, "Autonomous Systems");
        assert_eq!(used.len(), 2);
        let calls = labeler.calls.lock().unwrap();
        assert!(calls[0].1.contains("Robotics"));
    }

    #[tokio::test]
    async fn test_assign_label_falls_back_on_failure() {
        let labeler = ScriptedLabeler::new(vec![Err(LabelError::NetworkError("down".to_string()))]);
        let used: BTreeSet<String> = ["Robotics".to_string()].into_iter().collect();

        let (label, _) = assign_label(7, &words(&["robotics"]), used, &labeler).await;
        assert_eq!(label, "topic_7");
    }

    #[tokio::test]
    async fn test_assign_label_rejects_taken_generated_label() {
        let labeler = ScriptedLabeler::new(vec![Ok("Robotics".to_string())]);
        let used: BTreeSet<String> = ["Robotics".to_string()].into_iter().collect();

        let (label, _) = assign_label(2, &words(&["robotics"]), used, &labeler).await;
        assert_eq!(label, "topic_2");
    }

    #[tokio::test]
    async fn test_assign_label_without_keywords_skips_generator() {
        let labeler = ScriptedLabeler::new(vec![Ok("Anything".to_string())]);
        let (label, _) = assign_label(4, &[], BTreeSet::new(), &labeler).await;
        assert_eq!(label, "topic_4");
        assert_eq!(labeler.call_count(), 0);
    }

    #[test]
    fn test_unique_pairs_keeps_highest_score() {
        let rows = vec![
            SupervisorTopic::new("a", 1, 0.2),
            SupervisorTopic::new("b", 1, 0.5),
            SupervisorTopic::new("a", 1, 0.9),
        ];
        let kept = unique_pairs(rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].uuid, "a");
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_deduplicate_remaps_rows() {
        let topics = vec![
            topic(0, "Graphs", &["graphs", "trees"]),
            topic(1, "Robotics", &["robotics"]),
            topic(2, "Graphs", &["graphs", "trees"]),
        ];
        let rows = vec![
            SupervisorTopic::new("a", 2, 0.7),
            SupervisorTopic::new("b", 0, 0.3),
            SupervisorTopic::new("b", 2, 0.4),
            SupervisorTopic::new("c", 1, 1.0),
        ];

        let outcome = deduplicate_topics(topics, rows);

        assert_eq!(outcome.topics.iter().map(|t| t.topic_id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(outcome.remap, BTreeMap::from([(2, 0)]));
        assert!(outcome.supervisor_topics.iter().all(|r| r.topic_id != Some(2)));
        let a = outcome.supervisor_topics.iter().find(|r| r.uuid == "a").unwrap();
        assert_eq!(a.topic_id, Some(0));
        let b: Vec<_> = outcome.supervisor_topics.iter().filter(|r| r.uuid == "b").collect();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].score, 0.4);
    }

    #[test]
    fn test_same_label_different_keywords_not_merged() {
        let topics = vec![topic(0, "Graphs", &["graphs"]), topic(1, "Graphs", &["networks"])];
        let outcome = deduplicate_topics(topics, vec![]);
        assert_eq!(outcome.topics.len(), 2);
        assert!(outcome.remap.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_unique_labels() {
        let labeler = ScriptedLabeler::new(vec![Ok("Networks".to_string())]);
        let mut topics = vec![
            topic(0, "Graphs", &["graphs"]),
            topic(1, "Graphs", &["networks"]),
            topic(2, "", &[]),
        ];

        ensure_unique_labels(&mut topics, &labeler).await;

        let labels: Vec<&str> = topics.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["Graphs", "Networks", "topic_2"]);
    }

    #[test]
    fn test_validate_drops_nan_none_and_unknown() {
        let topics = vec![topic(0, "Graphs", &["graphs"])];
        let rows = vec![
            SupervisorTopic::new("a", 0, f64::NAN),
            SupervisorTopic {
                uuid: "b".to_string(),
                topic_id: None,
                score: 1.0,
            },
            SupervisorTopic::new("c", 0, 0.0),
            SupervisorTopic::new("d", 9, 0.5),
            SupervisorTopic::new("e", 0, f64::INFINITY),
        ];

        let (valid, dropped) = validate_supervisor_topics(rows, &topics);

        assert_eq!(dropped, 4);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].uuid, "c");
        assert_eq!(valid[0].score, 0.0);
    }
}
