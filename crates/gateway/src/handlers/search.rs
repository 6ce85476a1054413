//! Direct search handler
//!
//! One semantic search without query expansion, followed by a lookup of the
//! matched pages and the legislation each of them references.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use validator::Validate;

use crate::handlers::chat::invalid_body;
use crate::AppState;
use lexforge_common::{
    db::models::ClicPage,
    errors::{AppError, Result},
    DEFAULT_LANGUAGE,
};
use lexforge_search::{PrimaryResult, SearchOptions, SecondaryResult, SectionNode};

/// Search request
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SearchRequest {
    pub query: Option<String>,

    /// Content language: en, sc or tc
    pub language: Option<String>,

    #[validate(range(min = 1, max = 50))]
    pub top: Option<usize>,

    #[validate(range(max = 1000))]
    pub skip: Option<usize>,

    /// Topic tags to restrict the search to
    #[serde(default)]
    pub filter: Vec<String>,
}

/// Search response
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<PrimaryResult>,
    pub pages: Vec<PageWithReferences>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageWithReferences {
    #[serde(flatten)]
    pub page: ClicPage,
    pub referenced_sections: Vec<SecondaryResult>,
}

/// Only English content is indexed so far
fn check_language(language: Option<&str>) -> Result<&str> {
    match language.unwrap_or(DEFAULT_LANGUAGE) {
        "en" => Ok("en"),
        code @ ("sc" | "tc") => Err(AppError::NotImplemented {
            message: format!("Chinese content ({}) is not supported yet", code),
        }),
        code => Err(AppError::UnsupportedLanguage {
            code: code.to_string(),
        }),
    }
}

/// Perform a search
pub async fn search(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>> {
    let start = Instant::now();
    let Json(request) = payload.map_err(invalid_body)?;

    let query = request.query.as_deref().ok_or_else(|| AppError::MissingField {
        field: "query".to_string(),
    })?;
    if query.trim().is_empty() {
        return Err(AppError::Validation {
            message: "Query must not be blank".to_string(),
            field: Some("query".to_string()),
        });
    }

    let language = check_language(request.language.as_deref())?;

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let options = SearchOptions {
        top: request.top.unwrap_or(state.pipeline.settings().search_top),
        skip: request.skip.unwrap_or(0),
        topics: request.filter.clone(),
    };

    let budget = state.config.request_timeout();
    let response = tokio::time::timeout(budget, run_search(&state, query, language, &options))
        .await
        .map_err(|_| AppError::ServiceUnavailable {
            message: format!("Search did not complete within {}s", budget.as_secs()),
        })??;

    tracing::info!(
        query = %query,
        results = response.results.len(),
        pages = response.pages.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Search completed"
    );

    Ok(Json(response))
}

async fn run_search(
    state: &AppState,
    query: &str,
    language: &str,
    options: &SearchOptions,
) -> Result<SearchResponse> {
    let results: Vec<PrimaryResult> = state
        .search
        .search(query, options)
        .await?
        .try_collect()
        .await?;

    let mut seen = HashSet::new();
    let nids: Vec<i64> = results
        .iter()
        .map(|r| r.nid)
        .filter(|nid| seen.insert(*nid))
        .collect();

    let found = state.repo.find_pages_by_nids(&nids, language).await?;

    let mut references: HashMap<i64, Vec<SecondaryResult>> = HashMap::new();
    for row in state.repo.referenced_sections_for_pages(&nids, language).await? {
        let origin = row.origin_id;
        references
            .entry(origin)
            .or_default()
            .push(SectionNode::from(row).section);
    }

    let pages = found
        .into_iter()
        .map(|page| PageWithReferences {
            referenced_sections: references.remove(&page.nid).unwrap_or_default(),
            page,
        })
        .collect();

    Ok(SearchResponse { results, pages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_router;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use lexforge_search::MockSearchBackend;
    use serde_json::Value;
    use tower::ServiceExt;

    fn search_request(body: &str) -> Request<Body> {
        Request::post("/api/search")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn error_code(search: MockSearchBackend, body: &str) -> (StatusCode, Value) {
        let response = test_router(search)
            .oneshot(search_request(body))
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[test]
    fn test_check_language() {
        assert_eq!(check_language(None).unwrap(), "en");
        assert!(matches!(check_language(Some("tc")), Err(AppError::NotImplemented { .. })));
        assert!(matches!(
            check_language(Some("fr")),
            Err(AppError::UnsupportedLanguage { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_and_blank_query() {
        let (status, _) = error_code(MockSearchBackend::new(), r#"{"language":"en"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_code(MockSearchBackend::new(), r#"{"query":"   "}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_code(MockSearchBackend::new(), "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_language_support() {
        let (status, _) = error_code(MockSearchBackend::new(), r#"{"query":"lease","language":"sc"}"#).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

        let (status, _) = error_code(MockSearchBackend::new(), r#"{"query":"lease","language":"de"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_top_out_of_range() {
        let (status, _) = error_code(MockSearchBackend::new(), r#"{"query":"lease","top":0}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_matches_skips_database() {
        let (status, json) = error_code(MockSearchBackend::new(), r#"{"query":"tenancy deposit"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"], serde_json::json!([]));
        assert_eq!(json["pages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_search_failure_is_bad_gateway() {
        let search = MockSearchBackend::new().with_failure("tenancy deposit");
        let (status, _) = error_code(search, r#"{"query":"tenancy deposit"}"#).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
