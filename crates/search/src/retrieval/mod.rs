//! Semantic retrieval over the hosted search index
//!
//! Provides:
//! - `PrimaryResult`, the typed page chunk returned by search
//! - The `SearchBackend` port and its Azure AI Search implementation
//! - Concurrent fan-out of several queries with per-leg isolation

mod azure;
mod fanout;

pub use azure::AzureSearchClient;
pub use fanout::{fan_out, LegEvent};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A page chunk matched by semantic search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryResult {
    /// Natural id of the page
    pub nid: i64,

    /// Chunk index within the page
    pub chunk_no: i64,

    pub title: String,

    pub content: String,

    /// Topic tag of the page
    pub topic: String,

    pub url: String,

    /// Hybrid relevance score
    pub score: Option<f64>,

    /// Semantic reranker score, when reranking ran
    pub reranker_score: Option<f64>,

    /// Extractive caption
    pub caption: String,

    /// Caption with highlight markup
    pub caption_highlights: String,
}

impl PrimaryResult {
    /// Identity key: (nid, chunk_no)
    pub fn key(&self) -> (i64, i64) {
        (self.nid, self.chunk_no)
    }

    /// Stable citation id
    pub fn source_id(&self) -> String {
        format!("clic-{}-{}", self.nid, self.chunk_no)
    }

    /// Score used for display ordering: reranker first, then relevance
    pub fn display_score(&self) -> Option<f64> {
        self.reranker_score.or(self.score)
    }
}

/// Parameters for one search call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Number of results requested
    pub top: usize,

    /// Results to skip
    pub skip: usize,

    /// Restrict to these topic tags (empty = no restriction)
    pub topics: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top: 10,
            skip: 0,
            topics: Vec::new(),
        }
    }
}

impl SearchOptions {
    pub fn with_top(top: usize) -> Self {
        Self {
            top,
            ..Self::default()
        }
    }

    /// OData filter restricting results to the requested topics
    pub fn topic_filter(&self) -> Option<String> {
        let topics: Vec<String> = self
            .topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.replace('\'', "''").replace('|', ""))
            .collect();

        if topics.is_empty() {
            None
        } else {
            Some(format!("search.in(topic, '{}', '|')", topics.join("|")))
        }
    }
}

/// Ordered, lazily consumed sequence of search results
pub type ResultStream = BoxStream<'static, Result<PrimaryResult>>;

/// Hosted search service port
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run one query. The index embeds the query text itself.
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<ResultStream>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
enum MockResponse {
    Results(Vec<PrimaryResult>),
    Fail,
    /// Yield the results, then fail
    Interrupt(Vec<PrimaryResult>),
}

/// Mock search backend for testing. Unknown queries return no results.
#[derive(Default)]
pub struct MockSearchBackend {
    responses: HashMap<String, MockResponse>,
    calls: Mutex<Vec<String>>,
}

impl MockSearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(mut self, query: &str, results: Vec<PrimaryResult>) -> Self {
        self.responses
            .insert(query.to_string(), MockResponse::Results(results));
        self
    }

    pub fn with_failure(mut self, query: &str) -> Self {
        self.responses.insert(query.to_string(), MockResponse::Fail);
        self
    }

    pub fn with_interruption(mut self, query: &str, results: Vec<PrimaryResult>) -> Self {
        self.responses
            .insert(query.to_string(), MockResponse::Interrupt(results));
        self
    }

    /// Queries received so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Distinct queries received so far
    pub fn distinct_calls(&self) -> HashSet<String> {
        self.calls().into_iter().collect()
    }
}

#[async_trait]
impl SearchBackend for MockSearchBackend {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<ResultStream> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(query.to_string());
        }

        let failure = || AppError::SearchError {
            message: format!("mock failure for '{}'", query),
        };

        match self.responses.get(query) {
            None => Ok(stream::empty().boxed()),
            Some(MockResponse::Fail) => Err(failure()),
            Some(MockResponse::Results(results)) => {
                let items: Vec<Result<PrimaryResult>> =
                    results.iter().take(options.top).cloned().map(Ok).collect();
                Ok(stream::iter(items).boxed())
            }
            Some(MockResponse::Interrupt(results)) => {
                let mut items: Vec<Result<PrimaryResult>> =
                    results.iter().cloned().map(Ok).collect();
                items.push(Err(failure()));
                Ok(stream::iter(items).boxed())
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(nid: i64, chunk_no: i64) -> PrimaryResult {
        PrimaryResult {
            nid,
            chunk_no,
            title: format!("Page {}", nid),
            url: format!("https://clic.org.hk/en/topics/{}", nid),
            ..Default::default()
        }
    }

    #[test]
    fn test_display_score_prefers_reranker() {
        let mut result = page(1, 0);
        result.score = Some(0.03);
        assert_eq!(result.display_score(), Some(0.03));
        result.reranker_score = Some(2.7);
        assert_eq!(result.display_score(), Some(2.7));
    }

    #[test]
    fn test_source_id() {
        assert_eq!(page(42, 3).source_id(), "clic-42-3");
        assert_eq!(page(42, 3).key(), (42, 3));
    }

    #[test]
    fn test_topic_filter() {
        assert_eq!(SearchOptions::default().topic_filter(), None);

        let options = SearchOptions {
            topics: vec!["Intellectual Property".into(), " ".into(), "Landlord's Rights".into()],
            ..Default::default()
        };
        assert_eq!(
            options.topic_filter().as_deref(),
            Some("search.in(topic, 'Intellectual Property|Landlord''s Rights', '|')")
        );
    }

    #[tokio::test]
    async fn test_mock_backend() {
        let backend = MockSearchBackend::new()
            .with_results("copyright", vec![page(1, 0), page(2, 0)])
            .with_failure("broken");

        let stream =
            tokio_test::assert_ok!(backend.search("copyright", &SearchOptions::with_top(1)).await);
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 1);

        assert!(backend.search("broken", &SearchOptions::default()).await.is_err());
        assert_eq!(backend.calls(), vec!["copyright".to_string(), "broken".to_string()]);
    }
}
