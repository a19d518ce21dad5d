//! Pipeline configuration.
//!
//! Every field has a default matching a production run, so a configuration file only
//! needs to name what it changes.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::models::{ModelKind, Pooling, RepresentationVariant};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Job titles that make a researcher eligible to supervise.
pub const DEFAULT_ALLOWED_TITLES: &[&str] = &[
    "Associate Professor",
    "PhD fellow",
    "Assistant Professor",
    "Professor",
    "Postdoc",
    "Head of Section",
    "Head of PhD School",
    "Head of Studies",
    "Head of Study Programme",
    "Head of Center",
    "Deputy Head of Department",
    "Deputy Head of Center",
    "Co-head of study programme",
    "Co-head of Study Programme",
    "Co-head of PhD School",
    "Full Professor",
    "Full Professor, Head of PhD School",
    "Full Professor, Co-head of PhD School",
    "Full Professor, Head of Center",
    "Full Professor, Co-head of Center",
    "Full Professor, Deputy Head of Department",
    "Full Professor, Deputy Head of Center",
    "Full Professor, Head of Studies",
    "Full Professor, Head of Study Programme",
    "Full Professor, Co-head of Study Programme",
];

/// One local encoder.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EncoderSpec {
    pub kind: ModelKind,

    /// Directory holding `model.onnx` and `tokenizer.json`
    pub model_dir: PathBuf,

    /// Maximum context length in tokens; longer inputs are truncated
    pub max_length: usize,

    /// Hidden dimension of the encoder output
    pub dimension: usize,

    /// Whether the ONNX graph takes a `token_type_ids` input
    pub token_type_ids: bool,
}

impl EncoderSpec {
    /// Default spec for a model kind, rooted at `models_root/<kind>`.
    pub fn for_kind(kind: ModelKind, models_root: &Path) -> Self {
        let (max_length, token_type_ids) = match kind {
            ModelKind::ModernBert => (8192, false),
            ModelKind::Bert | ModelKind::SciBert | ModelKind::Specter2 => (512, true),
        };
        Self {
            kind,
            model_dir: models_root.join(kind.key()),
            max_length,
            dimension: 768,
            token_type_ids,
        }
    }
}

/// Topic discovery parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    /// Upper bound of the vectorizer n-gram range (lower bound is 1)
    pub ngram_max: usize,
    pub n_neighbors: usize,
    pub n_components: usize,
    pub min_cluster_floor: usize,
    pub min_cluster_cap: usize,
    pub min_samples: usize,
    pub epochs: usize,
    pub seed: u64,
    pub top_topics_per_researcher: usize,
    pub keywords_per_topic: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            ngram_max: 4,
            n_neighbors: 15,
            n_components: 5,
            min_cluster_floor: 2,
            min_cluster_cap: 10,
            min_samples: 1,
            epochs: 200,
            seed: 42,
            top_topics_per_researcher: 5,
            keywords_per_topic: 10,
        }
    }
}

impl TopicConfig {
    /// Neighbourhood size for a corpus; never exceeds `n_docs - 1`.
    pub fn neighbors_for(&self, n_docs: usize) -> usize {
        self.n_neighbors.min(n_docs.saturating_sub(1))
    }

    /// Minimum cluster size for a corpus, proportional to its size.
    pub fn min_cluster_size_for(&self, n_docs: usize) -> usize {
        self.min_cluster_floor
            .max(self.min_cluster_cap.min(n_docs / 2))
    }
}

/// Full configuration of an ingestion run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Researchers per upsert batch
    pub batch_size: usize,
    pub allowed_titles: Vec<String>,
    pub primary_model: ModelKind,
    pub models_root: PathBuf,
    /// Explicit encoder specs; empty means defaults for every model the variants use
    pub encoders: Vec<EncoderSpec>,
    pub variants: Vec<String>,
    pub serving_variant: String,
    pub topics: TopicConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            allowed_titles: DEFAULT_ALLOWED_TITLES.iter().map(|t| t.to_string()).collect(),
            primary_model: ModelKind::Specter2,
            models_root: PathBuf::from("models"),
            encoders: Vec::new(),
            variants: RepresentationVariant::defaults()
                .iter()
                .map(RepresentationVariant::name)
                .collect(),
            serving_variant: RepresentationVariant::new(ModelKind::Specter2, Pooling::Averaged, true)
                .name(),
            topics: TopicConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed representation variants.
    pub fn representation_variants(&self) -> Result<Vec<RepresentationVariant>, ConfigError> {
        self.variants
            .iter()
            .map(|name| name.parse().map_err(ConfigError::Invalid))
            .collect()
    }

    /// Encoder specs for every model the run needs, primary model included.
    pub fn encoder_specs(&self) -> Result<Vec<EncoderSpec>, ConfigError> {
        let mut kinds: Vec<ModelKind> = self
            .representation_variants()?
            .iter()
            .map(|v| v.model)
            .collect();
        kinds.push(self.primary_model);
        kinds.sort();
        kinds.dedup();

        Ok(kinds
            .into_iter()
            .map(|kind| {
                self.encoders
                    .iter()
                    .find(|spec| spec.kind == kind)
                    .cloned()
                    .unwrap_or_else(|| EncoderSpec::for_kind(kind, &self.models_root))
            })
            .collect())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".to_string()));
        }
        let variants = self.representation_variants()?;
        let serving: RepresentationVariant =
            self.serving_variant.parse().map_err(ConfigError::Invalid)?;
        if serving.model != self.primary_model {
            return Err(ConfigError::Invalid(format!(
                "serving variant '{}' must use the primary model '{}'",
                self.serving_variant, self.primary_model
            )));
        }
        if !variants.contains(&serving) {
            return Err(ConfigError::Invalid(format!(
                "serving variant '{}' is not among the built variants",
                self.serving_variant
            )));
        }
        if self.topics.ngram_max == 0 || self.topics.keywords_per_topic == 0 {
            return Err(ConfigError::Invalid(
                "ngram_max and keywords_per_topic must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.allowed_titles.len(), 25);
    }

    #[test]
    fn test_neighbors_clamped_to_corpus() {
        let topics = TopicConfig::default();
        assert_eq!(topics.neighbors_for(100), 15);
        assert_eq!(topics.neighbors_for(4), 3);
        assert_eq!(topics.neighbors_for(1), 0);
        assert_eq!(topics.neighbors_for(0), 0);
    }

    #[test]
    fn test_min_cluster_size_scales_with_floor() {
        let topics = TopicConfig::default();
        assert_eq!(topics.min_cluster_size_for(2), 2);
        assert_eq!(topics.min_cluster_size_for(12), 6);
        assert_eq!(topics.min_cluster_size_for(500), 10);
    }

    #[test]
    fn test_encoder_specs_cover_all_models() {
        let config = PipelineConfig::default();
        let specs = config.encoder_specs().unwrap();
        assert_eq!(specs.len(), 4);
        let modernbert = specs.iter().find(|s| s.kind == ModelKind::ModernBert).unwrap();
        assert_eq!(modernbert.max_length, 8192);
        assert!(!modernbert.token_type_ids);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            batch_size = 20
            variants = ["specter2_averaged_embedding", "specter2_averaged_embedding_with_keywords"]

            [topics]
            ngram_max = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.topics.ngram_max, 3);
        assert_eq!(config.topics.keywords_per_topic, 10);
        assert!(config.validate().is_ok());
        assert_eq!(config.encoder_specs().unwrap().len(), 1);
    }

    #[test]
    fn test_serving_variant_must_use_primary_model() {
        let config = PipelineConfig {
            serving_variant: "bert_averaged_embedding".to_string(),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
