//! Candidate acquisition.
//!
//! Pulls person and research-output records from a [`RegistrySource`], keeps the
//! researchers whose job title is on the allow-list, and attaches every usable
//! publication to each eligible author. The topic vocabulary is built from all
//! persons, eligible or not.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::models::Researcher;
use crate::normalizer::{
    extract_contributor_uuids, extract_job_titles, extract_keywords, normalize_abstract,
    normalize_researcher,
};
use crate::provider::{ProviderResult, RegistrySource};

/// Outcome of one acquisition pass.
#[derive(Debug, Clone, Default)]
pub struct Population {
    /// Eligible researchers with at least one abstract, in registry order
    pub supervisors: Vec<Researcher>,

    /// Every keyword mentioned by any person in the registry
    pub vocabulary: BTreeSet<String>,

    /// Person records seen
    pub persons_seen: usize,

    /// Research-output records seen
    pub outputs_seen: usize,
}

/// Whether any of a person's job titles is allowed to supervise.
pub fn is_eligible(record: &serde_json::Value, allowed_titles: &HashSet<&str>) -> bool {
    extract_job_titles(record)
        .iter()
        .any(|title| allowed_titles.contains(title.as_str()))
}

/// Fetch and normalize the supervisor population.
///
/// # Arguments
/// * `source` - Registry to read from
/// * `allowed_titles` - Job titles that make a person eligible
///
/// # Errors
/// Any `ProviderError` from the source is returned unchanged; nothing is kept from a
/// failed pass.
pub async fn acquire(
    source: &dyn RegistrySource,
    allowed_titles: &[String],
) -> ProviderResult<Population> {
    info!(source = source.name(), "Acquiring registry records");
    let persons = source.fetch_persons().await?;
    let outputs = source.fetch_research_outputs().await?;

    let allowed: HashSet<&str> = allowed_titles.iter().map(String::as_str).collect();

    let mut vocabulary = BTreeSet::new();
    let mut supervisors: Vec<Researcher> = Vec::new();
    for record in &persons {
        vocabulary.extend(extract_keywords(record));
        if !is_eligible(record, &allowed) {
            continue;
        }
        if let Some(researcher) = normalize_researcher(record) {
            if supervisors.iter().all(|s| s.uuid != researcher.uuid) {
                supervisors.push(researcher);
            }
        }
    }

    let index: HashMap<String, usize> = supervisors
        .iter()
        .enumerate()
        .map(|(i, r)| (r.uuid.clone(), i))
        .collect();

    let mut kept_outputs = 0;
    for record in &outputs {
        let authors: Vec<usize> = extract_contributor_uuids(record)
            .iter()
            .filter_map(|uuid| index.get(uuid).copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if authors.is_empty() {
            continue;
        }
        let Some(abs) = normalize_abstract(record) else {
            continue;
        };
        kept_outputs += 1;
        for author in authors {
            supervisors[author].abstracts.push(abs.clone());
        }
    }

    let eligible = supervisors.len();
    supervisors.retain(|r| !r.abstracts.is_empty());
    debug!(
        eligible,
        dropped_without_abstracts = eligible - supervisors.len(),
        kept_outputs,
        "Associated publications with researchers"
    );
    info!(
        supervisors = supervisors.len(),
        vocabulary = vocabulary.len(),
        "Acquisition complete"
    );

    Ok(Population {
        supervisors,
        vocabulary,
        persons_seen: persons.len(),
        outputs_seen: outputs.len(),
    })
}
