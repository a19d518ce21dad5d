//! Registry snapshot stored as a JSON file.
//!
//! The file holds `{"persons": [...], "research_outputs": [...]}` exactly as the
//! registry returned them, which makes pipeline runs reproducible offline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ProviderError, ProviderResult, RegistrySource};

/// On-disk layout of a registry snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub persons: Vec<Value>,
    #[serde(default)]
    pub research_outputs: Vec<Value>,
}

impl RegistrySnapshot {
    /// Pull a complete snapshot from any source.
    pub async fn capture(source: &dyn RegistrySource) -> ProviderResult<Self> {
        Ok(Self {
            persons: source.fetch_persons().await?,
            research_outputs: source.fetch_research_outputs().await?,
        })
    }

    /// Write the snapshot as pretty JSON.
    pub async fn save(&self, path: &Path) -> ProviderResult<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

/// Serves records from a snapshot file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    name: String,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("json:{}", path.display());
        Self { path, name }
    }

    async fn load(&self) -> ProviderResult<RegistrySnapshot> {
        let raw = tokio::fs::read(&self.path).await?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&raw).map_err(|e| {
            ProviderError::ParseError(format!("{}: {}", self.path.display(), e))
        })?;
        debug!(
            persons = snapshot.persons.len(),
            outputs = snapshot.research_outputs.len(),
            "Loaded registry snapshot"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl RegistrySource for JsonFileSource {
    async fn fetch_persons(&self) -> ProviderResult<Vec<Value>> {
        Ok(self.load().await?.persons)
    }

    async fn fetch_research_outputs(&self) -> ProviderResult<Vec<Value>> {
        Ok(self.load().await?.research_outputs)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
