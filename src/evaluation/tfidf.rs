//! Lexical TF-IDF baseline over concatenated abstracts.

use std::collections::{BTreeMap, HashMap};

use crate::models::{Researcher, Vector};
use crate::topics::vectorizer::{ngrams, tokenize};

/// Variant name reported for the baseline.
pub const BASELINE_VARIANT: &str = "tfidf_baseline";

/// Features kept, by document frequency.
pub const MAX_FEATURES: usize = 5000;

/// Unigram + bigram TF-IDF model with smooth idf and L2-normalised rows.
#[derive(Debug, Clone)]
pub struct TfidfIndex {
    columns: HashMap<String, usize>,
    idf: Vec<f64>,
}

fn terms(text: &str) -> Vec<String> {
    ngrams(&tokenize(text), 1, 2)
}

impl TfidfIndex {
    /// Fit on `documents`, keeping the `max_features` most frequent terms by document
    /// frequency (ties by term order).
    pub fn fit(documents: &[String], max_features: usize) -> Self {
        let mut df: BTreeMap<String, usize> = BTreeMap::new();
        for doc in documents {
            let mut seen: Vec<String> = terms(doc);
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = df.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(max_features);
        ranked.sort_by(|a, b| a.0.cmp(&b.0));

        let n = documents.len() as f64;
        let idf = ranked
            .iter()
            .map(|(_, df)| ((1.0 + n) / (1.0 + *df as f64)).ln() + 1.0)
            .collect();
        let columns = ranked
            .into_iter()
            .enumerate()
            .map(|(i, (term, _))| (term, i))
            .collect();
        Self { columns, idf }
    }

    pub fn feature_count(&self) -> usize {
        self.idf.len()
    }

    /// Dense, L2-normalised TF-IDF vector of `text`.
    pub fn transform(&self, text: &str) -> Vector {
        let mut row = vec![0.0f64; self.idf.len()];
        for term in terms(text) {
            if let Some(&column) = self.columns.get(&term) {
                row[column] += self.idf[column];
            }
        }
        let norm = row.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            row.iter_mut().for_each(|x| *x /= norm);
        }
        row.into_iter().map(|x| x as f32).collect()
    }
}

/// Concatenated abstract text of a researcher.
pub fn researcher_document(researcher: &Researcher) -> String {
    researcher
        .abstracts
        .iter()
        .map(|a| a.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<String> {
        vec![
            "graph algorithms for graph coloring".to_string(),
            "robot control and robot learning".to_string(),
            "learning graph representations".to_string(),
        ]
    }

    #[test]
    fn test_fit_uses_unigrams_and_bigrams() {
        let index = TfidfIndex::fit(&docs(), MAX_FEATURES);
        assert!(index.columns.contains_key("graph"));
        assert!(index.columns.contains_key("robot control"));
        assert!(!index.columns.contains_key("graph algorithms for"));
    }

    #[test]
    fn test_max_features_keeps_most_frequent() {
        let index = TfidfIndex::fit(&docs(), 2);
        assert_eq!(index.feature_count(), 2);
        assert!(index.columns.contains_key("graph"));
        assert!(index.columns.contains_key("learning"));
    }

    #[test]
    fn test_transform_is_unit_length() {
        let index = TfidfIndex::fit(&docs(), MAX_FEATURES);
        let v = index.transform("graph coloring with robots");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_text_is_zero_vector() {
        let index = TfidfIndex::fit(&docs(), MAX_FEATURES);
        assert!(index.transform("zzz qqq").iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_rarer_terms_weigh_more() {
        let index = TfidfIndex::fit(&docs(), MAX_FEATURES);
        let v = index.transform("graph coloring");
        let graph = v[index.columns["graph"]];
        let coloring = v[index.columns["coloring"]];
        assert!(coloring > graph);
    }
}
