//! Legislation cross-references
//!
//! Provides:
//! - `SecondaryResult`, a statute section reached from search results
//! - The `ReferenceStore` port over the relational reference graph
//! - `ReferenceExpander`, a bounded breadth-first traversal with a timeout

mod expander;
mod store;

pub use expander::{hops_for_depth, ExpansionOutcome, ExpansionStatus, ReferenceExpander};
pub use store::SqlReferenceStore;

use async_trait::async_trait;
use lexforge_common::db::SectionRow;
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A legislation section cross-referenced from a page or another section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryResult {
    pub cap_number: String,
    pub section_number: String,
    pub subsection_number: Option<String>,
    pub cap_title: String,
    pub section_heading: String,
    pub content: String,
    /// Canonical identity
    pub url: String,
}

impl SecondaryResult {
    /// Stable citation id
    pub fn source_id(&self) -> String {
        format!(
            "cap-{}-{}-{}",
            self.cap_number,
            self.section_number,
            self.subsection_number.as_deref().unwrap_or("none")
        )
    }

    /// Citation title, e.g. `Cap 528, 118: Copyright Ordinance`
    pub fn citation_title(&self) -> String {
        format!(
            "Cap {}, {}: {}",
            self.cap_number, self.section_number, self.cap_title
        )
    }
}

/// A section row together with its store id, used to continue traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionNode {
    pub id: i64,
    pub section: SecondaryResult,
}

impl From<SectionRow> for SectionNode {
    fn from(row: SectionRow) -> Self {
        SectionNode {
            id: row.id,
            section: SecondaryResult {
                cap_number: row.cap_number,
                section_number: row.section_number,
                subsection_number: row.subsection_number.filter(|s| !s.trim().is_empty()),
                cap_title: row.cap_title,
                section_heading: row.section_heading.unwrap_or_default(),
                content: row.content,
                url: row.url,
            },
        }
    }
}

/// Relational reference graph port
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Sections directly referenced by the pages with these natural ids
    async fn sections_referenced_by_pages(&self, nids: &[i64]) -> Result<Vec<SectionNode>>;

    /// Sections directly referenced by the sections with these ids
    async fn sections_referenced_by_sections(&self, ids: &[i64]) -> Result<Vec<SectionNode>>;
}

/// In-memory reference graph for testing
#[derive(Default)]
pub struct MockReferenceStore {
    pages: HashMap<i64, Vec<SectionNode>>,
    sections: HashMap<i64, Vec<SectionNode>>,
    delay: Option<Duration>,
    failing: bool,
    lookups: AtomicUsize,
}

impl MockReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page `nid` references `node`
    pub fn with_page_reference(mut self, nid: i64, node: SectionNode) -> Self {
        self.pages.entry(nid).or_default().push(node);
        self
    }

    /// Section `from` references `node`
    pub fn with_section_reference(mut self, from: i64, node: SectionNode) -> Self {
        self.sections.entry(from).or_default().push(node);
        self
    }

    /// Every lookup sleeps this long first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Number of lookups served
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    async fn lookup(&self, edges: &HashMap<i64, Vec<SectionNode>>, ids: &[i64]) -> Result<Vec<SectionNode>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(AppError::DatabaseConnection {
                message: "mock reference store unavailable".to_string(),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| edges.get(id))
            .flatten()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReferenceStore for MockReferenceStore {
    async fn sections_referenced_by_pages(&self, nids: &[i64]) -> Result<Vec<SectionNode>> {
        self.lookup(&self.pages, nids).await
    }

    async fn sections_referenced_by_sections(&self, ids: &[i64]) -> Result<Vec<SectionNode>> {
        self.lookup(&self.sections, ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(subsection: Option<&str>, heading: Option<&str>) -> SectionRow {
        SectionRow {
            origin_id: 42,
            id: 9001,
            cap_number: "528".to_string(),
            section_number: "118".to_string(),
            subsection_number: subsection.map(str::to_string),
            cap_title: "Copyright Ordinance".to_string(),
            section_heading: heading.map(str::to_string),
            content: "Offences relating to infringing copies".to_string(),
            url: "https://www.elegislation.gov.hk/hk/cap528!en/s118".to_string(),
        }
    }

    #[test]
    fn test_source_id_and_title() {
        let node = SectionNode::from(row(None, Some("Offences")));
        assert_eq!(node.id, 9001);
        assert_eq!(node.section.source_id(), "cap-528-118-none");
        assert_eq!(node.section.citation_title(), "Cap 528, 118: Copyright Ordinance");

        let node = SectionNode::from(row(Some("4"), None));
        assert_eq!(node.section.source_id(), "cap-528-118-4");
        assert_eq!(node.section.section_heading, "");
    }

    #[test]
    fn test_blank_subsection_is_none() {
        let node = SectionNode::from(row(Some("  "), None));
        assert_eq!(node.section.subsection_number, None);
    }

    #[tokio::test]
    async fn test_mock_store() {
        let node = SectionNode::from(row(None, None));
        let store = MockReferenceStore::new().with_page_reference(42, node.clone());

        let found = store.sections_referenced_by_pages(&[42, 43]).await.unwrap();
        assert_eq!(found, vec![node]);
        assert!(store.sections_referenced_by_sections(&[9001]).await.unwrap().is_empty());
        assert_eq!(store.lookups(), 2);

        let store = MockReferenceStore::new().failing();
        assert!(store.sections_referenced_by_pages(&[42]).await.is_err());
    }
}
