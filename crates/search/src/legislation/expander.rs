//! Bounded breadth-first expansion of legislation references
//!
//! Hop 1 follows page → section edges; every further hop follows
//! section → section edges from the sections discovered on the previous hop.
//! A section is cited at most once (by URL) and every row id is expanded at
//! most once, so cycles in the stored graph terminate. Rows that share a URL
//! collapse into one citation but all of their outgoing edges are followed. The whole traversal races a wall-clock timeout; on timeout or
//! lookup error the expansion yields nothing and the caller carries on.

use super::{ReferenceStore, SecondaryResult};
use crate::dedup::SeenSet;
use lexforge_common::config::MAX_REFERENCE_HOPS;
use lexforge_common::errors::Result;
use lexforge_common::metrics;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a reference expansion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStatus {
    /// Depth too small or nothing to expand from
    Skipped,
    Completed,
    TimedOut,
    Failed,
}

impl ExpansionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpansionStatus::Skipped => "skipped",
            ExpansionStatus::Completed => "completed",
            ExpansionStatus::TimedOut => "timed_out",
            ExpansionStatus::Failed => "failed",
        }
    }

    /// True when the lookup ran but produced nothing usable
    pub fn is_degraded(&self) -> bool {
        matches!(self, ExpansionStatus::TimedOut | ExpansionStatus::Failed)
    }
}

/// Result of one expansion
#[derive(Debug, Clone)]
pub struct ExpansionOutcome {
    /// Unique by URL, in discovery order (shallower hops first)
    pub sections: Vec<SecondaryResult>,
    pub status: ExpansionStatus,
    pub elapsed: Duration,
    /// Hops requested after clamping
    pub hops: usize,
}

impl ExpansionOutcome {
    fn skipped() -> Self {
        Self {
            sections: Vec::new(),
            status: ExpansionStatus::Skipped,
            elapsed: Duration::ZERO,
            hops: 0,
        }
    }
}

/// Map a client search depth onto traversal hops.
///
/// 0 and 1 search only; 2 is one hop, 3 two hops, anything larger three.
pub fn hops_for_depth(search_depth: i64) -> usize {
    search_depth
        .saturating_sub(1)
        .clamp(0, MAX_REFERENCE_HOPS as i64) as usize
}

/// Expands search results into the legislation they reference
#[derive(Clone)]
pub struct ReferenceExpander {
    store: Arc<dyn ReferenceStore>,
    timeout: Duration,
    hop_cap: usize,
}

impl ReferenceExpander {
    pub fn new(store: Arc<dyn ReferenceStore>, timeout: Duration, hop_cap: usize) -> Self {
        Self {
            store,
            timeout,
            hop_cap: hop_cap.min(MAX_REFERENCE_HOPS),
        }
    }

    /// Expand from the given page nids for a client search depth
    pub async fn expand(&self, nids: &[i64], search_depth: i64) -> ExpansionOutcome {
        let hops = hops_for_depth(search_depth).min(self.hop_cap);
        if hops == 0 || nids.is_empty() {
            return ExpansionOutcome::skipped();
        }

        let started = Instant::now();
        let traversal = tokio::time::timeout(self.timeout, self.traverse(nids, hops)).await;
        let elapsed = started.elapsed();

        let (sections, status) = match traversal {
            Ok(Ok(sections)) => {
                tracing::debug!(
                    pages = nids.len(),
                    hops = hops,
                    sections = sections.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Reference expansion completed"
                );
                (sections, ExpansionStatus::Completed)
            }
            Ok(Err(error)) => {
                tracing::warn!(error = %error, hops = hops, "Reference expansion failed");
                (Vec::new(), ExpansionStatus::Failed)
            }
            Err(_) => {
                // The in-flight lookup is dropped here; the database ends the
                // query on its own statement timeout.
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    hops = hops,
                    "Reference expansion timed out"
                );
                (Vec::new(), ExpansionStatus::TimedOut)
            }
        };

        metrics::record_reference_expansion(status.as_str(), elapsed.as_secs_f64());

        ExpansionOutcome {
            sections,
            status,
            elapsed,
            hops,
        }
    }

    async fn traverse(&self, nids: &[i64], hops: usize) -> Result<Vec<SecondaryResult>> {
        let mut visited = SeenSet::new();
        let mut expanded = HashSet::new();
        let mut sections = Vec::new();
        let mut frontier = self.store.sections_referenced_by_pages(nids).await?;

        for hop in 1..=hops {
            let mut next_ids = Vec::new();
            for node in frontier {
                if expanded.insert(node.id) {
                    next_ids.push(node.id);
                }
                if visited.admit(&node.section) {
                    sections.push(node.section);
                }
            }

            if hop == hops || next_ids.is_empty() {
                break;
            }
            frontier = self.store.sections_referenced_by_sections(&next_ids).await?;
        }

        Ok(sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legislation::{MockReferenceStore, SectionNode};

    fn node(id: i64, cap: &str, section: &str) -> SectionNode {
        SectionNode {
            id,
            section: SecondaryResult {
                cap_number: cap.to_string(),
                section_number: section.to_string(),
                cap_title: format!("Cap {}", cap),
                content: format!("Text of cap {} s{}", cap, section),
                url: format!("https://www.elegislation.gov.hk/hk/cap{}!en/s{}", cap, section),
                ..Default::default()
            },
        }
    }

    /// page 42 → 528 s118 → 528 s119 → 200 s1 → back to 528 s118
    fn cyclic_store() -> MockReferenceStore {
        MockReferenceStore::new()
            .with_page_reference(42, node(1, "528", "118"))
            .with_section_reference(1, node(2, "528", "119"))
            .with_section_reference(2, node(3, "200", "1"))
            .with_section_reference(3, node(1, "528", "118"))
            .with_section_reference(3, node(4, "200", "2"))
    }

    fn expander(store: MockReferenceStore) -> ReferenceExpander {
        ReferenceExpander::new(Arc::new(store), Duration::from_secs(10), 3)
    }

    fn urls(outcome: &ExpansionOutcome) -> HashSet<String> {
        outcome.sections.iter().map(|s| s.url.clone()).collect()
    }

    #[test]
    fn test_hops_for_depth() {
        assert_eq!(hops_for_depth(-1), 0);
        assert_eq!(hops_for_depth(0), 0);
        assert_eq!(hops_for_depth(1), 0);
        assert_eq!(hops_for_depth(2), 1);
        assert_eq!(hops_for_depth(3), 2);
        assert_eq!(hops_for_depth(4), 3);
        assert_eq!(hops_for_depth(99), 3);
    }

    #[tokio::test]
    async fn test_shallow_depth_skips_store() {
        let store = Arc::new(cyclic_store());
        let expander = ReferenceExpander::new(store.clone(), Duration::from_secs(10), 3);

        for depth in [0, 1] {
            let outcome = expander.expand(&[42], depth).await;
            assert_eq!(outcome.status, ExpansionStatus::Skipped);
            assert!(outcome.sections.is_empty());
        }
        assert_eq!(store.lookups(), 0);

        let outcome = expander.expand(&[], 3).await;
        assert_eq!(outcome.status, ExpansionStatus::Skipped);
    }

    #[tokio::test]
    async fn test_depth_bounds_hops() {
        let expander = expander(cyclic_store());

        let one_hop = expander.expand(&[42], 2).await;
        assert_eq!(one_hop.status, ExpansionStatus::Completed);
        assert_eq!(one_hop.sections.len(), 1);
        assert_eq!(one_hop.sections[0].source_id(), "cap-528-118-none");

        let two_hops = expander.expand(&[42], 3).await;
        assert_eq!(two_hops.sections.len(), 2);

        let three_hops = expander.expand(&[42], 4).await;
        assert_eq!(three_hops.hops, 3);
        assert_eq!(three_hops.sections.len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_terminates_without_revisits() {
        let expander = expander(cyclic_store());
        let outcome = expander.expand(&[42], 10).await;

        let unique = urls(&outcome);
        assert_eq!(unique.len(), outcome.sections.len());
        assert!(!unique.contains("https://www.elegislation.gov.hk/hk/cap200!en/s2"));
    }

    #[tokio::test]
    async fn test_shared_url_collapses() {
        let mut duplicate = node(77, "528", "118");
        duplicate.section.section_heading = "second row, same url".to_string();
        let store = MockReferenceStore::new()
            .with_page_reference(42, node(1, "528", "118"))
            .with_page_reference(43, duplicate);

        let outcome = expander(store).expand(&[42, 43], 2).await;
        assert_eq!(outcome.sections.len(), 1);
        assert_eq!(outcome.sections[0].section_heading, "");
    }

    #[tokio::test]
    async fn test_shared_url_rows_keep_their_edges() {
        let store = MockReferenceStore::new()
            .with_page_reference(42, node(1, "528", "118"))
            .with_page_reference(43, node(77, "528", "118"))
            .with_section_reference(77, node(5, "200", "9"));

        let outcome = expander(store).expand(&[42, 43], 3).await;
        assert_eq!(outcome.status, ExpansionStatus::Completed);
        assert_eq!(outcome.sections.len(), 2);
        assert!(urls(&outcome).contains("https://www.elegislation.gov.hk/hk/cap200!en/s9"));
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent() {
        let expander = expander(cyclic_store());
        let first = expander.expand(&[42], 4).await;
        let second = expander.expand(&[42], 4).await;
        assert_eq!(urls(&first), urls(&second));
    }

    #[tokio::test]
    async fn test_hop_cap_from_config() {
        let expander = ReferenceExpander::new(Arc::new(cyclic_store()), Duration::from_secs(10), 1);
        let outcome = expander.expand(&[42], 4).await;
        assert_eq!(outcome.hops, 1);
        assert_eq!(outcome.sections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_empty() {
        let store = cyclic_store().with_delay(Duration::from_secs(30));
        let outcome = expander(store).expand(&[42], 3).await;

        assert_eq!(outcome.status, ExpansionStatus::TimedOut);
        assert!(outcome.status.is_degraded());
        assert!(outcome.sections.is_empty());
        assert!(outcome.elapsed >= Duration::from_secs(10));
        assert!(outcome.elapsed < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_store_error_yields_empty() {
        let outcome = expander(cyclic_store().failing()).expand(&[42], 3).await;
        assert_eq!(outcome.status, ExpansionStatus::Failed);
        assert!(outcome.sections.is_empty());
    }
}
