//! Reference store backed by the relational database

use super::{ReferenceStore, SectionNode};
use async_trait::async_trait;
use lexforge_common::db::Repository;
use lexforge_common::errors::Result;

/// Reads reference edges through the shared repository
#[derive(Clone)]
pub struct SqlReferenceStore {
    repo: Repository,
    /// Language of the pages the traversal starts from
    language: String,
}

impl SqlReferenceStore {
    pub fn new(repo: Repository, language: impl Into<String>) -> Self {
        Self {
            repo,
            language: language.into(),
        }
    }
}

#[async_trait]
impl ReferenceStore for SqlReferenceStore {
    async fn sections_referenced_by_pages(&self, nids: &[i64]) -> Result<Vec<SectionNode>> {
        let rows = self
            .repo
            .referenced_sections_for_pages(nids, &self.language)
            .await?;
        Ok(rows.into_iter().map(SectionNode::from).collect())
    }

    async fn sections_referenced_by_sections(&self, ids: &[i64]) -> Result<Vec<SectionNode>> {
        let rows = self.repo.referenced_sections_for_sections(ids).await?;
        Ok(rows.into_iter().map(SectionNode::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexforge_common::db::DbPool;

    #[tokio::test]
    async fn test_store_surfaces_database_errors() {
        let store = SqlReferenceStore::new(Repository::new(DbPool::disconnected()), "en");
        assert!(store.sections_referenced_by_pages(&[42]).await.is_err());
        assert!(store.sections_referenced_by_pages(&[]).await.unwrap().is_empty());
    }
}
