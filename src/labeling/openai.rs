//! Label generation through an OpenAI-compatible `responses` endpoint.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LabelError, LabelGenerator, LabelResult};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

const INSTRUCTIONS: &str = "You are given a cluster of keywords related to a research topic. \
Generate a concise, general and descriptive label of one to three words for the research area \
these keywords represent. Students use the labels to choose research areas, so keep them broad \
and easily understandable and avoid uncommon or overly technical words. Capitalize the label \
properly, for example 'Machine Learning in Imaging'. Output only the label text.";

/// Labeler backed by the `responses` API.
#[derive(Debug, Clone)]
pub struct OpenAiLabeler {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiLabeler {
    /// Build a labeler.
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. `https://api.openai.com/v1`
    /// * `api_key` - Bearer token
    /// * `model` - Model name (defaults to `gpt-4.1-mini` if None)
    ///
    /// # Errors
    /// Returns `LabelError::ConfigError` for an empty or non-header-safe key
    pub fn new(base_url: &str, api_key: &str, model: Option<String>) -> LabelResult<Self> {
        if api_key.trim().is_empty() {
            return Err(LabelError::ConfigError("missing API key".to_string()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .map_err(|e| LabelError::ConfigError(format!("invalid API key: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LabelError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

fn prompt(keywords: &[String], used: &BTreeSet<String>) -> String {
    let used: Vec<&str> = used.iter().map(String::as_str).collect();
    format!(
        "Here are the keywords in the cluster: \"{}\". \
         The following labels have already been used so choose another: \"{}\". \
         Labels are not to be reused.",
        keywords.join(", "),
        used.join(", ")
    )
}

#[derive(Serialize)]
struct ResponseRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: String,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ResponseBody {
    fn output_text(&self) -> String {
        self.output
            .iter()
            .flat_map(|item| &item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect::<String>()
            .trim()
            .to_string()
    }
}

#[async_trait]
impl LabelGenerator for OpenAiLabeler {
    async fn generate(&self, keywords: &[String], used: &BTreeSet<String>) -> LabelResult<String> {
        let body = ResponseRequest {
            model: &self.model,
            instructions: INSTRUCTIONS,
            input: prompt(keywords, used),
        };
        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| LabelError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LabelError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ResponseBody = response
            .json()
            .await
            .map_err(|e| LabelError::InvalidResponse(e.to_string()))?;
        let label = parsed.output_text();
        if label.is_empty() {
            return Err(LabelError::InvalidResponse("empty label".to_string()));
        }
        debug!(label = %label, keywords = keywords.len(), "Generated topic label");
        Ok(label)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
