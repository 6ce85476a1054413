//! Azure AI Search adapter
//!
//! Issues hybrid queries (lexical + vector + semantic reranking) against the
//! page index. Documents are validated one by one at this boundary; a
//! malformed document is dropped with a warning instead of failing the call.

use super::{PrimaryResult, ResultStream, SearchBackend, SearchOptions};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lexforge_common::config::SearchConfig;
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::time::{Duration, Instant};

/// Fields fetched for every document
const SELECT_FIELDS: &str = "nid,title,content,url,topic,chunk_no";

/// Azure AI Search client bound to one index
pub struct AzureSearchClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    semantic_configuration: String,
    vector_field: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct Caption {
    text: Option<String>,
    highlights: Option<String>,
}

#[derive(Deserialize)]
struct SearchDocument {
    #[serde(deserialize_with = "lenient_i64")]
    nid: i64,
    #[serde(deserialize_with = "lenient_i64")]
    chunk_no: i64,
    title: String,
    content: String,
    url: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "@search.score")]
    score: Option<f64>,
    #[serde(rename = "@search.rerankerScore")]
    reranker_score: Option<f64>,
    #[serde(rename = "@search.captions", default)]
    captions: Option<Vec<Caption>>,
}

/// Integers sometimes arrive as strings from string-keyed indexes
fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(value) => Ok(value),
        IntOrString::Str(value) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl From<SearchDocument> for PrimaryResult {
    fn from(doc: SearchDocument) -> Self {
        let caption = doc.captions.and_then(|c| c.into_iter().next());
        let (caption, caption_highlights) = match caption {
            Some(c) => (c.text.unwrap_or_default(), c.highlights.unwrap_or_default()),
            None => (String::new(), String::new()),
        };

        PrimaryResult {
            nid: doc.nid,
            chunk_no: doc.chunk_no,
            title: doc.title,
            content: doc.content,
            topic: doc.topic.unwrap_or_default(),
            url: doc.url,
            score: doc.score,
            reranker_score: doc.reranker_score,
            caption,
            caption_highlights,
        }
    }
}

/// Validate raw documents and order them by display score.
/// Returns the kept results and the number of dropped documents.
fn parse_documents(documents: Vec<serde_json::Value>) -> (Vec<PrimaryResult>, usize) {
    let mut dropped = 0;
    let mut results: Vec<PrimaryResult> = documents
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<SearchDocument>(raw) {
            Ok(doc) => Some(doc.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed search document");
                dropped += 1;
                None
            }
        })
        .collect();

    // Stable: ties keep backend order
    results.sort_by(|a, b| {
        let a = a.display_score().unwrap_or(f64::NEG_INFINITY);
        let b = b.display_score().unwrap_or(f64::NEG_INFINITY);
        b.total_cmp(&a)
    });

    (results, dropped)
}

impl AzureSearchClient {
    /// Create a client from the `search` config section
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/indexes/{}/docs/search?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.index_name,
                config.api_version
            ),
            api_key: config.api_key.clone(),
            semantic_configuration: config.semantic_configuration.clone(),
            vector_field: config.vector_field.clone(),
        })
    }

    fn request_body(&self, query: &str, options: &SearchOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "search": query,
            "top": options.top,
            "skip": options.skip,
            "queryType": "semantic",
            "searchMode": "all",
            "select": SELECT_FIELDS,
            "semanticConfiguration": self.semantic_configuration,
            "captions": "extractive",
            "vectorQueries": [{
                "kind": "text",
                "text": query,
                "fields": self.vector_field,
            }],
        });

        if let Some(filter) = options.topic_filter() {
            body["filter"] = serde_json::Value::String(filter);
        }

        body
    }
}

#[async_trait]
impl SearchBackend for AzureSearchClient {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<ResultStream> {
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&self.request_body(query, options))
            .send()
            .await
            .map_err(|e| AppError::SearchError {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SearchError {
                message: format!("Search API error {}: {}", status, body),
            });
        }

        let page: SearchResponse = response.json().await.map_err(|e| AppError::SearchError {
            message: format!("Failed to parse search response: {}", e),
        })?;

        let (results, dropped) = parse_documents(page.value);

        tracing::debug!(
            query = %query,
            results = results.len(),
            dropped = dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Search call completed"
        );

        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    fn name(&self) -> &str {
        "azure-ai-search"
    }
}
