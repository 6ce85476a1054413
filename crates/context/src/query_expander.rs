//! Query expansion
//!
//! Rewrites a conversation into a few independent search queries with one
//! structured-output call. The model output is advisory: it is trimmed,
//! deduplicated and truncated, and an empty result falls back to the last
//! user utterance.

use crate::prompts;
use lexforge_common::conversation::{last_user_utterance, ConversationTurn};
use lexforge_common::errors::{AppError, Result};
use lexforge_common::llm::{Generator, ObjectRequest};
use lexforge_common::metrics;
use std::collections::HashSet;
use std::sync::Arc;

/// Where the final queries came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Generated,
    /// The model returned nothing usable
    EmptyFallback,
    /// The generation call failed
    ErrorFallback,
}

impl QuerySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuerySource::Generated => "generated",
            QuerySource::EmptyFallback => "empty_fallback",
            QuerySource::ErrorFallback => "error_fallback",
        }
    }
}

/// Expansion result; `queries` is never empty
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedQueries {
    pub queries: Vec<String>,
    pub source: QuerySource,
}

pub struct QueryExpander {
    generator: Arc<dyn Generator>,
    max_queries: usize,
    fallback_on_error: bool,
}

impl QueryExpander {
    pub fn new(generator: Arc<dyn Generator>, max_queries: usize, fallback_on_error: bool) -> Self {
        Self {
            generator,
            max_queries: max_queries.max(1),
            fallback_on_error,
        }
    }

    /// Serialize turns as `role: text` lines under a fixed heading
    pub fn conversation_prompt(turns: &[ConversationTurn]) -> String {
        let lines: Vec<String> = turns
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.text()))
            .collect();
        format!("{}\n{}", prompts::CONVERSATION_PREFIX, lines.join("\n"))
    }

    pub async fn expand(&self, turns: &[ConversationTurn]) -> Result<ExpandedQueries> {
        let utterance = last_user_utterance(turns).ok_or_else(|| AppError::Validation {
            message: "Conversation has no user message".to_string(),
            field: Some("messages".to_string()),
        })?;

        let request = ObjectRequest {
            system: prompts::QUERY_EXPANSION_SYSTEM.to_string(),
            prompt: Self::conversation_prompt(turns),
            schema_name: "query_expansion".to_string(),
            schema: prompts::query_schema(),
        };

        let expanded = match self.generator.generate_object(&request).await {
            Ok(value) => {
                let queries = normalize(&value, self.max_queries);
                if queries.is_empty() {
                    tracing::warn!("Query expansion returned no queries, using the user message");
                    ExpandedQueries {
                        queries: vec![utterance],
                        source: QuerySource::EmptyFallback,
                    }
                } else {
                    ExpandedQueries {
                        queries,
                        source: QuerySource::Generated,
                    }
                }
            }
            Err(error) if self.fallback_on_error => {
                tracing::warn!(error = %error, "Query expansion failed, using the user message");
                ExpandedQueries {
                    queries: vec![utterance],
                    source: QuerySource::ErrorFallback,
                }
            }
            Err(error) => {
                metrics::record_query_expansion("failed");
                return Err(error);
            }
        };

        metrics::record_query_expansion(expanded.source.as_str());
        tracing::info!(
            queries = ?expanded.queries,
            source = expanded.source.as_str(),
            "Queries expanded"
        );

        Ok(expanded)
    }
}

/// Trim, drop blanks and exact duplicates, keep at most `max`
fn normalize(value: &serde_json::Value, max: usize) -> Vec<String> {
    let Some(items) = value.get("queries").and_then(|q| q.as_array()) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| item.as_str())
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .filter(|query| seen.insert(query.to_string()))
        .take(max)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexforge_common::llm::MockGenerator;
    use serde_json::json;

    fn copyright_turns() -> Vec<ConversationTurn> {
        vec![ConversationTurn::user(
            "What is the punishment for copyright infringement?",
        )]
    }

    fn expander(generator: MockGenerator, fallback: bool) -> QueryExpander {
        QueryExpander::new(Arc::new(generator), 3, fallback)
    }

    #[test]
    fn test_conversation_prompt() {
        let turns = vec![
            ConversationTurn::user("Can I be fined for fare evasion on the MTR?"),
            ConversationTurn::assistant("Yes, under the bylaws."),
        ];
        assert_eq!(
            QueryExpander::conversation_prompt(&turns),
            "The conversation history is as follows:\nuser: Can I be fined for fare evasion on the MTR?\nassistant: Yes, under the bylaws."
        );
    }

    #[test]
    fn test_normalize() {
        let value = json!({"queries": ["  a ", "", "b", "a", 5, "c", "d"]});
        assert_eq!(normalize(&value, 3), vec!["a", "b", "c"]);
        assert!(normalize(&json!({"other": []}), 3).is_empty());
    }

    #[tokio::test]
    async fn test_generated_queries() {
        let generator = MockGenerator::new(
            &[
                "copyright infringement criminal penalty",
                "Copyright Ordinance Cap 528 offences",
                "civil remedies for copyright infringement",
            ],
            &[],
        );
        let expanded = expander(generator, true).expand(&copyright_turns()).await.unwrap();

        assert_eq!(expanded.source, QuerySource::Generated);
        assert_eq!(expanded.queries.len(), 3);
        assert!(expanded.queries.iter().any(|q| q.contains("copyright infringement")));
    }

    #[tokio::test]
    async fn test_empty_output_falls_back_to_utterance() {
        let generator = MockGenerator::new(&[], &[]).with_object(json!({"queries": ["  "]}));
        let expanded = expander(generator, false).expand(&copyright_turns()).await.unwrap();

        assert_eq!(expanded.source, QuerySource::EmptyFallback);
        assert_eq!(
            expanded.queries,
            vec!["What is the punishment for copyright infringement?"]
        );
    }

    #[tokio::test]
    async fn test_generation_failure_policy() {
        let generator = MockGenerator::new(&[], &[]).with_failing_expansion();
        let expanded = expander(generator, true).expand(&copyright_turns()).await.unwrap();
        assert_eq!(expanded.source, QuerySource::ErrorFallback);

        let generator = MockGenerator::new(&[], &[]).with_failing_expansion();
        let err = expander(generator, false)
            .expand(&copyright_turns())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GenerationUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_requires_user_message() {
        let generator = MockGenerator::new(&["x"], &[]);
        let err = expander(generator, true)
            .expand(&[ConversationTurn::assistant("hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
