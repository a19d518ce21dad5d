//! Term counting over a controlled vocabulary and class-based TF-IDF.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("token pattern is valid"));

/// Word tokens of two or more word characters, lower-cased.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Every n-gram of `tokens` for n in `min..=max`, joined by single spaces.
pub fn ngrams(tokens: &[String], min: usize, max: usize) -> Vec<String> {
    let mut grams = Vec::new();
    for n in min.max(1)..=max {
        if n > tokens.len() {
            break;
        }
        grams.extend(tokens.windows(n).map(|window| window.join(" ")));
    }
    grams
}

/// Counts n-grams that belong to a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct CountVectorizer {
    /// term -> column
    columns: HashMap<String, usize>,
    /// column -> term, sorted
    terms: Vec<String>,
    ngram_max: usize,
}

impl CountVectorizer {
    /// Vectorizer restricted to `vocabulary`, counting n-grams of length `1..=ngram_max`.
    pub fn new(vocabulary: &BTreeSet<String>, ngram_max: usize) -> Self {
        let terms: Vec<String> = vocabulary.iter().cloned().collect();
        let columns = terms
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self {
            columns,
            terms,
            ngram_max: ngram_max.max(1),
        }
    }

    pub fn vocabulary_size(&self) -> usize {
        self.terms.len()
    }

    pub fn term(&self, column: usize) -> Option<&str> {
        self.terms.get(column).map(String::as_str)
    }

    /// Sparse vocabulary counts of one document.
    pub fn count(&self, text: &str) -> BTreeMap<usize, f64> {
        let mut counts = BTreeMap::new();
        for gram in ngrams(&tokenize(text), 1, self.ngram_max) {
            if let Some(&column) = self.columns.get(&gram) {
                *counts.entry(column).or_insert(0.0) += 1.0;
            }
        }
        counts
    }

    /// Class-based TF-IDF keywords per class.
    ///
    /// `classes` holds the summed counts of each class. Each row is L1-normalised and
    /// weighted by `ln(1 + A / f_t)`, where `A` is the mean token count per class and
    /// `f_t` the term's total count over all classes. Returns up to `top_n` terms per
    /// class with a positive weight, best first.
    pub fn class_keywords(&self, classes: &[BTreeMap<usize, f64>], top_n: usize) -> Vec<Vec<String>> {
        if classes.is_empty() {
            return Vec::new();
        }

        let mut totals: HashMap<usize, f64> = HashMap::new();
        let mut grand_total = 0.0;
        for class in classes {
            for (&column, &count) in class {
                *totals.entry(column).or_insert(0.0) += count;
                grand_total += count;
            }
        }
        let average = grand_total / classes.len() as f64;

        classes
            .iter()
            .map(|class| {
                let class_total: f64 = class.values().sum();
                if class_total == 0.0 {
                    return Vec::new();
                }
                let mut weighted: Vec<(usize, f64)> = class
                    .iter()
                    .filter_map(|(&column, &count)| {
                        let frequency = totals.get(&column).copied().unwrap_or(0.0);
                        if frequency == 0.0 {
                            return None;
                        }
                        let weight = (count / class_total) * (1.0 + average / frequency).ln();
                        (weight > 0.0).then_some((column, weight))
                    })
                    .collect();
                // Stable: equal weights keep vocabulary order.
                weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                weighted
                    .into_iter()
                    .take(top_n)
                    .filter_map(|(column, _)| self.term(column).map(str::to_string))
                    .collect()
            })
            .collect()
    }
}
