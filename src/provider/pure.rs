//! HTTP client for a Pure research-information registry.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::{ProviderError, ProviderResult, RegistrySource};

/// Records requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Paginated client for the `persons` and `research-outputs` collections.
#[derive(Debug, Clone)]
pub struct PureClient {
    client: Client,
    base_url: String,
    page_size: usize,
}

impl PureClient {
    /// Build a client sending `api-key` on every request.
    ///
    /// # Errors
    /// Returns `ProviderError::ConfigError` for an empty or non-header-safe key
    pub fn new(base_url: &str, api_key: &str) -> ProviderResult<Self> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::ConfigError("missing registry API key".to_string()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|e| ProviderError::ConfigError(format!("invalid API key: {}", e)))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&self, collection: &str, order: &str, offset: usize) -> ProviderResult<Value> {
        let url = format!("{}/{}", self.base_url, collection);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("size", self.page_size.to_string()),
                ("offset", offset.to_string()),
                ("order", order.to_string()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("{} page at {}: {}", collection, offset, e)))
    }

    /// Fetch pages until the reported `count` is reached or a page comes back empty.
    async fn fetch_all(&self, collection: &str, order: &str) -> ProviderResult<Vec<Value>> {
        let mut items: Vec<Value> = Vec::new();
        loop {
            let page = self.fetch_page(collection, order, items.len()).await?;
            let count = page.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
            let batch = match page.get("items") {
                Some(Value::Array(batch)) => batch.clone(),
                _ => Vec::new(),
            };
            debug!(collection, offset = items.len(), received = batch.len(), count, "Fetched page");

            if batch.is_empty() {
                break;
            }
            items.extend(batch);
            if items.len() >= count {
                break;
            }
        }
        info!(collection, total = items.len(), "Fetched registry collection");
        Ok(items)
    }
}

#[async_trait]
impl RegistrySource for PureClient {
    async fn fetch_persons(&self) -> ProviderResult<Vec<Value>> {
        self.fetch_all("persons", "lastName").await
    }

    async fn fetch_research_outputs(&self) -> ProviderResult<Vec<Value>> {
        self.fetch_all("research-outputs", "authorLastName").await
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
